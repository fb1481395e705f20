use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::utils::text::{plain_text, smart_truncate};
use crate::workflow::{IssueStatus, Phase, PhaseLease};

pub use interfaces::defs::{
    ClusterCandidate, ClusterGroup, ClusterRequest, ClusterResponse, CriterionVerdict,
    GenerateRequest, GenerateResponse, OracleCriterion, PhaseCounts,
    PhaseTriggerRequest, PhaseTriggerResponse, ScoreRequest, ScoreResponse,
};

pub type ItemId = Uuid;
pub type IssueId = Uuid;
pub type FeedId = Uuid;

/// Lowest and highest per-criterion score the scoring oracle may return.
pub const MIN_CRITERION_SCORE: i64 = 0;
pub const MAX_CRITERION_SCORE: i64 = 10;

/// A named content slot of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Primary,
    Secondary,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Primary => "primary",
            Section::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(Section::Primary),
            "secondary" => Ok(Section::Secondary),
            other => Err(PipelineError::General(format!("unknown section: {}", other))),
        }
    }
}

/// Which sections an ingested item may be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionAffinity {
    Primary,
    Secondary,
    Both,
}

impl SectionAffinity {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionAffinity::Primary => "primary",
            SectionAffinity::Secondary => "secondary",
            SectionAffinity::Both => "both",
        }
    }

    pub fn allows(&self, section: Section) -> bool {
        match self {
            SectionAffinity::Both => true,
            SectionAffinity::Primary => section == Section::Primary,
            SectionAffinity::Secondary => section == Section::Secondary,
        }
    }
}

impl FromStr for SectionAffinity {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(SectionAffinity::Primary),
            "secondary" => Ok(SectionAffinity::Secondary),
            "both" => Ok(SectionAffinity::Both),
            other => Err(PipelineError::General(format!("unknown section affinity: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub section: SectionAffinity,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Durable per-feed fetch bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRecord {
    pub id: FeedId,
    pub url: String,
    pub section: SectionAffinity,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub last_successful_fetch: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl FeedRecord {
    pub fn new(url: &str, section: SectionAffinity) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            section,
            etag: None,
            last_modified: None,
            last_fetch_time: None,
            last_successful_fetch: None,
            error_count: 0,
            last_error: None,
        }
    }
}

/// A unit of ingested content. `issue_id == None` means the item sits in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub feed_id: FeedId,
    pub url: String,
    pub title: String,
    pub body: String,
    pub full_text: Option<String>,
    pub media_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub section: SectionAffinity,
    pub issue_id: Option<IssueId>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn is_in_pool(&self) -> bool {
        self.issue_id.is_none() && !self.archived
    }

    /// Title plus plain-text body, capped at `max_chars`.
    pub fn oracle_text(&self, max_chars: usize) -> String {
        let body = self.full_text.as_deref().unwrap_or(&self.body);
        let text = format!("Title: {}\n\n{}", self.title, plain_text(body));
        smart_truncate(&text, max_chars)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    #[serde(alias = "prompt")]
    pub instruction: String,
    pub weight: f64,
}

impl From<&Criterion> for OracleCriterion {
    fn from(criterion: &Criterion) -> Self {
        Self {
            instruction: criterion.instruction.clone(),
            weight: criterion.weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub instruction: String,
    pub score: u8,
    pub weight: f64,
    pub rationale: String,
}

/// Weighted evaluation of one item. The total is always derived from the
/// per-criterion scores and is never set directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredRating")]
pub struct Rating {
    pub item_id: ItemId,
    pub criteria: Vec<CriterionScore>,
    total_score: f64,
    pub criteria_fingerprint: String,
    pub rated_at: DateTime<Utc>,
}

impl Rating {
    pub fn new(item_id: ItemId, criteria: Vec<CriterionScore>, criteria_fingerprint: String) -> Self {
        let total_score = weighted_total(&criteria);
        Self {
            item_id,
            criteria,
            total_score,
            criteria_fingerprint,
            rated_at: Utc::now(),
        }
    }

    /// Rebuilds a persisted rating; the total is recomputed, not read back.
    pub fn restore(
        item_id: ItemId,
        criteria: Vec<CriterionScore>,
        criteria_fingerprint: String,
        rated_at: DateTime<Utc>,
    ) -> Self {
        let mut rating = Self::new(item_id, criteria, criteria_fingerprint);
        rating.rated_at = rated_at;
        rating
    }

    pub fn total_score(&self) -> f64 {
        self.total_score
    }
}

#[derive(Deserialize)]
struct StoredRating {
    item_id: ItemId,
    criteria: Vec<CriterionScore>,
    criteria_fingerprint: String,
    rated_at: DateTime<Utc>,
}

impl From<StoredRating> for Rating {
    fn from(stored: StoredRating) -> Self {
        Rating::restore(
            stored.item_id,
            stored.criteria,
            stored.criteria_fingerprint,
            stored.rated_at,
        )
    }
}

/// Σ(score × weight) / Σ(weight). Zero when there is no weight at all.
pub fn weighted_total(criteria: &[CriterionScore]) -> f64 {
    let weight_sum: f64 = criteria.iter().map(|c| c.weight).sum();
    if weight_sum <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = criteria.iter().map(|c| c.score as f64 * c.weight).sum();
    weighted / weight_sum
}

/// Items judged to cover the same topic within one issue's candidate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: Uuid,
    pub issue_id: IssueId,
    pub topic_signature: String,
    pub primary_item_id: ItemId,
    pub suppressed_item_ids: BTreeSet<ItemId>,
    pub explanation: String,
    pub created_at: DateTime<Utc>,
}

impl DuplicateGroup {
    pub fn suppresses(&self, item_id: &ItemId) -> bool {
        self.suppressed_item_ids.contains(item_id)
    }
}

/// Audit timestamps, one per workflow action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueAudit {
    pub processing_started_at: Option<DateTime<Utc>>,
    pub phase2_pending_at: Option<DateTime<Utc>>,
    pub review_started_at: Option<DateTime<Utc>>,
    pub changes_made_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// One scheduled send cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub publication_id: String,
    pub target_date: NaiveDate,
    pub status: IssueStatus,
    pub subject: Option<String>,
    pub failure_reason: Option<String>,
    pub failed_phase: Option<Phase>,
    pub lease: Option<PhaseLease>,
    /// Number of times any phase has entered the busy state.
    pub attempts: u32,
    pub audit: IssueAudit,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(publication_id: &str, target_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            publication_id: publication_id.to_string(),
            target_date,
            status: IssueStatus::Draft,
            subject: None,
            failure_reason: None,
            failed_phase: None,
            lease: None,
            attempts: 0,
            audit: IssueAudit::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Selection of one item into one section of an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionAssignment {
    pub issue_id: IssueId,
    pub item_id: ItemId,
    pub section: Section,
    pub rank: u32,
    pub total_score: f64,
}

/// Generated, issue-ready content derived from one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub issue_id: IssueId,
    pub item_id: ItemId,
    pub section: Section,
    pub rank: u32,
    pub headline: String,
    pub body: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub feed_id: FeedId,
    pub success: bool,
    pub error: Option<String>,
    pub fetch_time: DateTime<Utc>,
    pub response_time_ms: u64,
    pub http_status: Option<u16>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_feed_size_mb: usize,
    pub max_redirects: usize,
    /// Minimum spacing between two requests to the same host.
    pub min_host_interval_ms: u64,
    pub max_concurrent_feeds: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Issue-Pipeline/1.0".to_string(),
            timeout_seconds: 30,
            max_feed_size_mb: 10,
            max_redirects: 5,
            min_host_interval_ms: 1000,
            max_concurrent_feeds: 4,
        }
    }
}

#[derive(Debug)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub guid: Option<String>,
    pub url: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Issue not found: {id}")]
    IssueNotFound { id: IssueId },

    #[error("Item not found: {id}")]
    ItemNotFound { id: ItemId },

    #[error("Issue {issue_id} is already {status}")]
    Conflict { issue_id: IssueId, status: IssueStatus },

    #[error("Issue {issue_id} lease for attempt {attempt} was lost")]
    LeaseLost { issue_id: IssueId, attempt: u32 },

    #[error("An open issue already exists for {date}")]
    IssueExists { date: NaiveDate },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: IssueStatus, to: IssueStatus },

    #[error("Issue belongs to publication {expected}, not {got}")]
    PublicationMismatch { expected: String, got: String },

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Malformed oracle output: {0}")]
    MalformedOracleOutput(String),

    #[error("Phase trigger failed: {0}")]
    Trigger(String),

    #[error("Phase {phase} exceeded its {budget_secs}s budget")]
    Timeout { phase: Phase, budget_secs: u64 },

    #[error("Feed size exceeds limit: {size_mb}MB")]
    FeedTooLarge { size_mb: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("General error: {0}")]
    General(String),
}

impl PipelineError {
    /// Data integrity conflicts are rejected, not treated as fatal.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            PipelineError::Conflict { .. } | PipelineError::IssueExists { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
