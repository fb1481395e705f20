use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

// Scoring oracle

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleCriterion {
    pub instruction: String,
    pub weight: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub item_text: String,
    pub criteria: Vec<OracleCriterion>,
}

/// One verdict per requested criterion, in request order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CriterionVerdict {
    pub score: i64,
    pub rationale: String,
}

/// The oracle never sends an aggregate; the caller computes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub criteria: Vec<CriterionVerdict>,
}

// Clustering oracle

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterCandidate {
    pub index: usize,
    pub summary: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub items: Vec<ClusterCandidate>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterGroup {
    pub topic_signature: String,
    pub primary_index: usize,
    pub duplicate_indices: Vec<usize>,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub groups: Vec<ClusterGroup>,
}

// Generation oracle

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub item_text: String,
    pub instructions: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub headline: String,
    pub body: String,
}

// Phase trigger endpoint

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseTriggerRequest {
    pub issue_id: Uuid,
    pub publication_id: String,
    /// Attempt number of the run that sent this trigger, if any.
    #[serde(default)]
    pub attempt: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounts {
    pub fetched: usize,
    pub scored: usize,
    pub score_failures: usize,
    pub suppressed: usize,
    pub assigned: usize,
    pub generated: usize,
    pub reclaimed: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseTriggerResponse {
    pub success: bool,
    pub message: String,
    pub next_phase: Option<String>,
    #[serde(default)]
    pub counts: PhaseCounts,
}

// Object style note:
// Phases run as short lived, stateless invocations. Anything a phase needs
// to know about an issue is read back from the store by id; nothing here
// carries state between invocations.
