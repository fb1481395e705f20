use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use crate::types::{Criterion, FeedConfig, FetchConfig, PipelineError, Result, Section};

/// Full runtime configuration of one publication's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub publication: PublicationConfig,
    pub sections: Vec<SectionConfig>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub budgets: Budgets,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicationConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Ranking criteria, feeds, assignment limit and generation style of one section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionConfig {
    #[serde(alias = "name")]
    pub section: Section,
    pub limit: usize,
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub style: String,
}

impl SectionConfig {
    /// Stable identifier of the criteria set; a rating made under a
    /// different set is stale.
    pub fn criteria_fingerprint(&self) -> String {
        criteria_fingerprint(&self.criteria)
    }
}

pub fn criteria_fingerprint(criteria: &[Criterion]) -> String {
    let mut hasher = Sha256::new();
    for criterion in criteria {
        hasher.update(criterion.instruction.as_bytes());
        hasher.update([0x1f]);
        hasher.update(criterion.weight.to_bits().to_be_bytes());
        hasher.update([0x1e]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_concurrency: usize,
    /// Cap on the item text sent for scoring and generation.
    pub max_item_chars: usize,
    /// Body characters included in each clustering summary.
    pub summary_chars: usize,
    pub subject_style: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 60,
            max_concurrency: 8,
            max_item_chars: 6000,
            summary_chars: 300,
            subject_style: "Write a short, engaging email subject line for this issue.".to_string(),
        }
    }
}

/// Execution budgets of the long-running phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    pub process_seconds: u64,
    pub generate_seconds: u64,
    /// Lease lifetime; a `processing` issue older than this is considered stuck.
    /// Must exceed both phase budgets.
    pub lease_ttl_seconds: u64,
    /// How long an issue may wait in `pending_phase2` for its chained trigger.
    pub trigger_grace_seconds: u64,
    /// Interval of the stuck-issue sweep run by `serve`.
    pub sweep_interval_seconds: u64,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            process_seconds: 600,
            generate_seconds: 600,
            lease_ttl_seconds: 900,
            trigger_grace_seconds: 900,
            sweep_interval_seconds: 60,
        }
    }
}

impl Budgets {
    pub fn for_phase(&self, phase: crate::workflow::Phase) -> Duration {
        match phase {
            crate::workflow::Phase::Process => Duration::from_secs(self.process_seconds),
            crate::workflow::Phase::Generate => Duration::from_secs(self.generate_seconds),
        }
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_seconds as i64)
    }

    pub fn trigger_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.trigger_grace_seconds as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Base URL of the phase endpoint. Without one, chained phases run in-process.
    pub base_url: Option<String>,
    pub max_retries: u32,
    pub timeout_seconds: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            max_retries: 3,
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool items older than this are archived by the maintenance command.
    pub archive_after_days: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { archive_after_days: 14 }
    }
}

impl PipelineConfig {
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(s).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.publication.id.trim().is_empty() {
            return Err(PipelineError::Config("publication.id must not be empty".to_string()));
        }
        if self.sections.is_empty() {
            return Err(PipelineError::Config("at least one section is required".to_string()));
        }

        let mut seen = HashSet::new();
        for section in &self.sections {
            if !seen.insert(section.section) {
                return Err(PipelineError::Config(format!(
                    "section {} is configured twice",
                    section.section
                )));
            }
            if section.limit == 0 {
                return Err(PipelineError::Config(format!(
                    "section {} needs a limit of at least 1",
                    section.section
                )));
            }
            if section.criteria.is_empty() {
                return Err(PipelineError::Config(format!(
                    "section {} has no criteria",
                    section.section
                )));
            }
            if let Some(bad) = section.criteria.iter().find(|c| !(c.weight > 0.0)) {
                return Err(PipelineError::Config(format!(
                    "criterion '{}' in section {} must have a positive weight",
                    bad.instruction, section.section
                )));
            }
            for feed in &section.feeds {
                url::Url::parse(&feed.url)?;
            }
        }

        let budgets = &self.budgets;
        let longest = budgets.process_seconds.max(budgets.generate_seconds);
        if budgets.lease_ttl_seconds <= longest {
            return Err(PipelineError::Config(format!(
                "budgets.lease_ttl_seconds ({}) must exceed the longest phase budget ({})",
                budgets.lease_ttl_seconds, longest
            )));
        }
        if budgets.sweep_interval_seconds == 0 {
            return Err(PipelineError::Config("budgets.sweep_interval_seconds must be at least 1".to_string()));
        }

        if self.oracle.max_concurrency == 0 {
            return Err(PipelineError::Config("oracle.max_concurrency must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn section(&self, section: Section) -> Option<&SectionConfig> {
        self.sections.iter().find(|s| s.section == section)
    }

    /// Every active feed across sections, each listed once.
    pub fn active_feeds(&self) -> Vec<FeedConfig> {
        let mut seen = HashSet::new();
        self.sections
            .iter()
            .flat_map(|s| s.feeds.iter())
            .filter(|f| f.active && seen.insert(f.url.clone()))
            .cloned()
            .collect()
    }
}
