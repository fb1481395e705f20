use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use issue_pipeline::{
    api, ChannelTrigger, ContentStore, HttpPhaseTrigger, InMemoryStore, IssuePipeline, LlmAdapter,
    LoggingTrigger, MockLlmAdapter, OpenAiAdapter, PgStore, Phase, PhaseTrigger, PhaseTriggerRequest,
    PipelineConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "issue-pipeline", version, about = "Newsletter issue production pipeline")]
struct Cli {
    /// Pipeline configuration file.
    #[arg(long, global = true, env = "PIPELINE_CONFIG", default_value = "config/pipeline.toml")]
    config: PathBuf,

    /// Keep state in memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,

    /// Use the deterministic mock oracle instead of the configured endpoint.
    #[arg(long, global = true)]
    mock_oracle: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the phase trigger endpoint and operator actions.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Start a new send cycle.
    CreateIssue {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Run one phase locally and print its result as JSON.
    RunPhase {
        #[arg(long)]
        issue: Uuid,
        #[arg(long)]
        phase: Phase,
        /// Keep running follow-up phases in this process.
        #[arg(long)]
        chain: bool,
    },
    /// Fetch every configured feed into the pool.
    Ingest,
    /// Fail issues whose phase lease has expired.
    Recover,
    /// Archive pool items older than the given number of days.
    Archive {
        #[arg(long)]
        days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("issue_pipeline=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    info!(
        "Loaded configuration for {} with {} sections",
        config.publication.id,
        config.sections.len()
    );

    let store = open_store(cli.memory).await?;
    let oracle = open_oracle(cli.mock_oracle, &config)?;

    match cli.command {
        Command::Serve { bind } => {
            let pipeline = match config.trigger.base_url.clone() {
                Some(base_url) => {
                    let trigger = HttpPhaseTrigger::new(&base_url, &config.trigger)
                        .context("building phase trigger")?;
                    Arc::new(IssuePipeline::new(store, oracle, Arc::new(trigger), config)?)
                }
                None => {
                    let (trigger, rx) = ChannelTrigger::new();
                    let pipeline = Arc::new(IssuePipeline::new(store, oracle, Arc::new(trigger), config)?);
                    tokio::spawn(pipeline.clone().run_triggers(rx));
                    pipeline
                }
            };

            tokio::spawn(pipeline.clone().run_recovery());

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("binding {}", bind))?;
            info!("Listening on {}", bind);
            axum::serve(listener, api::router(pipeline)).await?;
        }
        Command::CreateIssue { date } => {
            let pipeline = IssuePipeline::new(store, oracle, Arc::new(LoggingTrigger), config)?;
            let issue = pipeline.create_issue(date).await?;
            println!("{}", serde_json::to_string_pretty(&issue)?);
        }
        Command::RunPhase { issue, phase, chain } => {
            let (trigger, mut rx) = if chain {
                let (trigger, rx) = ChannelTrigger::new();
                (Arc::new(trigger) as Arc<dyn PhaseTrigger>, Some(rx))
            } else {
                (Arc::new(LoggingTrigger) as Arc<dyn PhaseTrigger>, None)
            };
            let pipeline = IssuePipeline::new(store, oracle, trigger, config)?;

            let request = PhaseTriggerRequest {
                issue_id: issue,
                publication_id: pipeline.publication_id().to_string(),
                attempt: None,
            };
            let mut outcome = pipeline.run_phase(phase, request).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);

            if let Some(rx) = rx.as_mut() {
                while let Ok((next, request)) = rx.try_recv() {
                    outcome = pipeline.run_phase(next, request).await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
            }

            if !outcome.is_success() {
                anyhow::bail!("phase {} did not complete: {}", outcome.phase, outcome.message);
            }
        }
        Command::Ingest => {
            let pipeline = IssuePipeline::new(store, oracle, Arc::new(LoggingTrigger), config)?;
            let report = pipeline.ingest().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Recover => {
            let pipeline = IssuePipeline::new(store, oracle, Arc::new(LoggingTrigger), config)?;
            let recovered = pipeline.recover_stuck().await?;
            info!("Recovered {} issues", recovered.len());
            for id in recovered {
                println!("{}", id);
            }
        }
        Command::Archive { days } => {
            let pipeline = IssuePipeline::new(store, oracle, Arc::new(LoggingTrigger), config)?;
            let archived = pipeline.archive_stale_items(days).await?;
            info!("Archived {} pool items", archived);
        }
    }

    Ok(())
}

async fn open_store(memory: bool) -> Result<Arc<dyn ContentStore>> {
    if memory {
        warn!("Using in-memory store; state is lost on exit");
        return Ok(Arc::new(InMemoryStore::new()));
    }

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let store = PgStore::new(&database_url)
        .await
        .context("connecting to Postgres")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

fn open_oracle(mock: bool, config: &PipelineConfig) -> Result<Arc<dyn LlmAdapter>> {
    if mock {
        return Ok(Arc::new(MockLlmAdapter::new("mock")));
    }
    let api_key = std::env::var("ORACLE_API_KEY").context("ORACLE_API_KEY is not set")?;
    Ok(Arc::new(OpenAiAdapter::new(&config.oracle, api_key)?))
}
