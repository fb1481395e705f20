//! Phase runner: guard, work under a budget, transition, chain.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::assign::assign_sections;
use crate::config::PipelineConfig;
use crate::dedup::DedupEngine;
use crate::generator::ArticleGenerator;
use crate::ingest::{FeedIngester, IngestReport};
use crate::llm_adapter::LlmAdapter;
use crate::pool;
use crate::scoring::ScoringEngine;
use crate::store::ContentStore;
use crate::trigger::PhaseTrigger;
use crate::types::{
    Issue, IssueId, Item, ItemId, PhaseCounts, PhaseTriggerRequest, PhaseTriggerResponse,
    PipelineError, Result,
};
use crate::workflow::{self, OperatorAction, Phase, PhaseStart};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    /// Stale or duplicate trigger; nothing was written.
    Skipped,
    /// The issue is already busy; nothing was written.
    Conflict,
    Failed,
}

/// Result of one phase invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub issue_id: IssueId,
    pub phase: Phase,
    pub kind: OutcomeKind,
    pub message: String,
    pub counts: PhaseCounts,
    /// Phase that was triggered after this one completed.
    pub next_phase: Option<Phase>,
}

impl PhaseOutcome {
    fn new(issue_id: IssueId, phase: Phase, kind: OutcomeKind, message: String) -> Self {
        Self {
            issue_id,
            phase,
            kind,
            message,
            counts: PhaseCounts::default(),
            next_phase: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, OutcomeKind::Completed | OutcomeKind::Skipped)
    }
}

impl From<PhaseOutcome> for PhaseTriggerResponse {
    fn from(outcome: PhaseOutcome) -> Self {
        PhaseTriggerResponse {
            success: outcome.is_success(),
            message: outcome.message,
            next_phase: outcome.next_phase.map(|p| p.to_string()),
            counts: outcome.counts,
        }
    }
}

struct PhaseWork {
    counts: PhaseCounts,
    subject: Option<String>,
}

/// Everything one publication's phases need: store, oracle-backed engines,
/// feed ingestion and the chain trigger.
pub struct IssuePipeline {
    store: Arc<dyn ContentStore>,
    config: PipelineConfig,
    trigger: Arc<dyn PhaseTrigger>,
    ingester: FeedIngester,
    scoring: ScoringEngine,
    dedup: DedupEngine,
    generator: ArticleGenerator,
    holder: String,
}

impl IssuePipeline {
    pub fn new(
        store: Arc<dyn ContentStore>,
        oracle: Arc<dyn LlmAdapter>,
        trigger: Arc<dyn PhaseTrigger>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let oracle_config = &config.oracle;
        let ingester = FeedIngester::new(store.clone(), config.fetch.clone())?;
        let scoring = ScoringEngine::new(
            oracle.clone(),
            oracle_config.max_concurrency,
            oracle_config.max_item_chars,
        );
        let dedup = DedupEngine::new(oracle.clone(), oracle_config.summary_chars);
        let generator = ArticleGenerator::new(
            oracle.clone(),
            oracle_config.max_concurrency,
            oracle_config.max_item_chars,
            oracle_config.subject_style.clone(),
        );

        info!(
            "Pipeline for {} using oracle {} and {} trigger",
            config.publication.id,
            oracle.adapter_name(),
            trigger.name()
        );

        Ok(Self {
            store,
            config,
            trigger,
            ingester,
            scoring,
            dedup,
            generator,
            holder: format!("pipeline-{}", Uuid::new_v4()),
        })
    }

    pub fn with_holder(mut self, holder: &str) -> Self {
        self.holder = holder.to_string();
        self
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn publication_id(&self) -> &str {
        &self.config.publication.id
    }

    pub async fn create_issue(&self, target_date: NaiveDate) -> Result<Issue> {
        workflow::create_issue(self.store.as_ref(), self.publication_id(), target_date).await
    }

    pub async fn apply_action(&self, issue_id: IssueId, action: OperatorAction) -> Result<Issue> {
        workflow::apply_action(self.store.as_ref(), issue_id, action).await
    }

    pub async fn recover_stuck(&self) -> Result<Vec<IssueId>> {
        workflow::recover_stuck(self.store.as_ref(), Utc::now(), self.config.budgets.trigger_grace()).await
    }

    /// Runs `recover_stuck` every `budgets.sweep_interval_seconds` until the
    /// task is dropped.
    pub async fn run_recovery(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.budgets.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Stuck-issue sweep every {:?}", self.config.budgets.sweep_interval());
        loop {
            ticker.tick().await;
            match self.recover_stuck().await {
                Ok(recovered) if !recovered.is_empty() => {
                    warn!("Sweep failed {} stuck issues: {:?}", recovered.len(), recovered)
                }
                Ok(_) => {}
                Err(e) => error!("Stuck-issue sweep failed: {}", e),
            }
        }
    }

    /// Pulls every active feed into the pool without touching any issue.
    pub async fn ingest(&self) -> IngestReport {
        self.ingester.ingest_all(&self.config.active_feeds()).await
    }

    pub async fn archive_stale_items(&self, days: Option<i64>) -> Result<usize> {
        let days = days.unwrap_or(self.config.pool.archive_after_days);
        pool::archive_stale_items(self.store.as_ref(), chrono::Duration::days(days), Utc::now()).await
    }

    /// Runs one phase for the issue named in `request`.
    ///
    /// Conflicts, stale triggers and phase failures are reported in the
    /// outcome. `Err` is reserved for requests that cannot be evaluated at
    /// all: an unknown issue, a publication mismatch, or a store failure.
    pub async fn run_phase(&self, phase: Phase, request: PhaseTriggerRequest) -> Result<PhaseOutcome> {
        let issue_id = request.issue_id;
        let issue = self.store.get_issue(issue_id).await?;
        self.check_publication(&issue, &request)?;

        if let Some(attempt) = request.attempt {
            if issue.status != phase.busy_status() && issue.attempts != attempt {
                info!(
                    "Ignoring {} trigger for issue {} from attempt {}; issue is at attempt {}",
                    phase, issue_id, attempt, issue.attempts
                );
                return Ok(PhaseOutcome::new(
                    issue_id,
                    phase,
                    OutcomeKind::Skipped,
                    format!("stale trigger from attempt {}", attempt),
                ));
            }
        }

        let started = workflow::begin_phase(
            self.store.as_ref(),
            issue_id,
            phase,
            &self.holder,
            self.config.budgets.lease_ttl(),
        )
        .await?;

        let running = match started {
            PhaseStart::Started(issue) => issue,
            PhaseStart::Conflict(status) => {
                warn!("Rejected {} for issue {}: already {}", phase, issue_id, status);
                return Ok(PhaseOutcome::new(
                    issue_id,
                    phase,
                    OutcomeKind::Conflict,
                    format!("issue is already {}", status),
                ));
            }
            PhaseStart::Skipped(status) => {
                return Ok(PhaseOutcome::new(
                    issue_id,
                    phase,
                    OutcomeKind::Skipped,
                    format!("issue is {}, nothing to do", status),
                ));
            }
        };

        let span = info_span!("phase", issue_id = %issue_id, phase = %phase, attempt = running.attempts);
        self.execute(phase, running).instrument(span).await
    }

    fn check_publication(&self, issue: &Issue, request: &PhaseTriggerRequest) -> Result<()> {
        if request.publication_id != issue.publication_id {
            return Err(PipelineError::PublicationMismatch {
                expected: issue.publication_id.clone(),
                got: request.publication_id.clone(),
            });
        }
        if issue.publication_id != self.config.publication.id {
            return Err(PipelineError::PublicationMismatch {
                expected: self.config.publication.id.clone(),
                got: issue.publication_id.clone(),
            });
        }
        Ok(())
    }

    async fn execute(&self, phase: Phase, running: Issue) -> Result<PhaseOutcome> {
        let issue_id = running.id;
        let budget = self.config.budgets.for_phase(phase);

        let work = async {
            match phase {
                Phase::Process => self.process(issue_id).await,
                Phase::Generate => self.generate(issue_id).await,
            }
        };

        let failure = match tokio::time::timeout(budget, work).await {
            Ok(Ok(work)) => return self.finish(phase, &running, work).await,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "timeout: {}",
                PipelineError::Timeout {
                    phase,
                    budget_secs: budget.as_secs(),
                }
            ),
        };

        error!("Phase {} failed for issue {}: {}", phase, issue_id, failure);
        let recorded = workflow::fail_issue(
            self.store.as_ref(),
            issue_id,
            Some(phase),
            Some(running.attempts),
            &failure,
        )
        .await?;
        if !recorded {
            warn!("Issue {} changed hands before the failure could be recorded", issue_id);
        }

        Ok(PhaseOutcome::new(issue_id, phase, OutcomeKind::Failed, failure))
    }

    async fn finish(&self, phase: Phase, running: &Issue, work: PhaseWork) -> Result<PhaseOutcome> {
        let issue_id = running.id;
        let done = match workflow::complete_phase(self.store.as_ref(), running, phase, work.subject).await {
            Ok(done) => done,
            Err(e @ PipelineError::LeaseLost { .. }) => {
                warn!("{}", e);
                let mut outcome = PhaseOutcome::new(issue_id, phase, OutcomeKind::Failed, e.to_string());
                outcome.counts = work.counts;
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };

        let mut outcome = PhaseOutcome::new(
            issue_id,
            phase,
            OutcomeKind::Completed,
            format!("{} completed, issue is {}", phase, done.status),
        );
        outcome.counts = work.counts;

        if let Some(next) = phase.next() {
            let request = PhaseTriggerRequest {
                issue_id,
                publication_id: done.publication_id.clone(),
                attempt: Some(done.attempts),
            };
            match self.trigger.trigger(next, request).await {
                Ok(()) => {
                    info!("Triggered {} for issue {}", next, issue_id);
                    outcome.message = format!("{}; {} triggered", outcome.message, next);
                    outcome.next_phase = Some(next);
                }
                Err(e) => {
                    warn!("Could not trigger {} for issue {}: {}", next, issue_id, e);
                    outcome.message = format!("{}; {} not triggered: {}", outcome.message, next, e);
                }
            }
        }

        Ok(outcome)
    }

    /// Ingest, bind the pool, score, deduplicate, assign sections.
    async fn process(&self, issue_id: IssueId) -> Result<PhaseWork> {
        let store = self.store.as_ref();
        let sections = &self.config.sections;
        let mut counts = PhaseCounts::default();

        let ingest = self.ingest().await;
        counts.fetched = ingest.fetched;

        pool::bind_pool_to_issue(store, issue_id).await?;
        let items = store.list_issue_items(issue_id).await?;

        let scoring = self.scoring.score_items(store, &items, sections).await?;
        counts.scored = scoring.scored + scoring.already_rated;
        counts.score_failures = scoring.failed.len();

        let ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        let ratings = store.get_ratings(&ids).await?;
        let rated: Vec<Item> = items.into_iter().filter(|i| ratings.contains_key(&i.id)).collect();

        let groups = self.dedup.run(store, issue_id, &rated).await?;
        counts.suppressed = groups.iter().map(|g| g.suppressed_item_ids.len()).sum();

        let assignment = assign_sections(store, issue_id, sections).await?;
        counts.assigned = assignment.assignments.len();
        counts.reclaimed = assignment.reclaimed.len();
        for section in sections {
            info!(
                "Issue {} {}: {} of {} slots filled",
                issue_id,
                section.section,
                assignment.for_section(section.section).count(),
                section.limit
            );
        }

        Ok(PhaseWork { counts, subject: None })
    }

    /// Generate articles, return unconsumed items, write the subject line.
    async fn generate(&self, issue_id: IssueId) -> Result<PhaseWork> {
        let store = self.store.as_ref();
        let mut counts = PhaseCounts::default();

        let report = self
            .generator
            .generate_for_issue(store, issue_id, &self.config.sections)
            .await?;
        if report.articles.is_empty() && !report.failed.is_empty() {
            return Err(PipelineError::General(format!(
                "no article could be generated ({} failures)",
                report.failed.len()
            )));
        }
        counts.generated = report.articles.len();

        let consumed: HashSet<ItemId> = store
            .list_articles(issue_id, true)
            .await?
            .iter()
            .map(|a| a.item_id)
            .collect();
        counts.reclaimed = pool::reclaim_unbound_items(store, issue_id, &consumed).await?.len();

        let subject = self.generator.generate_subject(&report.articles).await;
        Ok(PhaseWork { counts, subject })
    }

    /// Runs phases handed over by a `ChannelTrigger` until the channel closes.
    pub async fn run_triggers(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(Phase, PhaseTriggerRequest)>) {
        info!("Phase runner started");
        while let Some((phase, request)) = rx.recv().await {
            let issue_id = request.issue_id;
            match self.run_phase(phase, request).await {
                Ok(outcome) => info!(
                    "Chained {} for issue {}: {:?} ({})",
                    phase, issue_id, outcome.kind, outcome.message
                ),
                Err(e) => error!("Chained {} for issue {} could not run: {}", phase, issue_id, e),
            }
        }
        info!("Phase runner stopped");
    }
}
