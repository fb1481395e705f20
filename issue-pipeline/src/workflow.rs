//! Issue lifecycle state machine.
//!
//! The status column is the only coordination primitive shared by phase
//! invocations. Every change goes through a compare-and-set on that column
//! (plus the attempt counter), so two invocations racing on the same issue
//! can never both enter the busy state.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::store::ContentStore;
use crate::types::{Issue, IssueId, PipelineError, Result};

/// Number of times a guarded write is retried after losing a race.
const MAX_CAS_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Draft,
    Processing,
    PendingPhase2,
    InReview,
    ChangesMade,
    ReadyToSend,
    Sent,
    Failed,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 8] = [
        IssueStatus::Draft,
        IssueStatus::Processing,
        IssueStatus::PendingPhase2,
        IssueStatus::InReview,
        IssueStatus::ChangesMade,
        IssueStatus::ReadyToSend,
        IssueStatus::Sent,
        IssueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Draft => "draft",
            IssueStatus::Processing => "processing",
            IssueStatus::PendingPhase2 => "pending_phase2",
            IssueStatus::InReview => "in_review",
            IssueStatus::ChangesMade => "changes_made",
            IssueStatus::ReadyToSend => "ready_to_send",
            IssueStatus::Sent => "sent",
            IssueStatus::Failed => "failed",
        }
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition_to(&self, to: IssueStatus) -> bool {
        use IssueStatus::*;

        if to == Failed {
            return !matches!(self, Sent | Failed);
        }

        matches!(
            (self, to),
            (Draft, Processing)
                | (Processing, PendingPhase2)
                | (Processing, InReview)
                | (PendingPhase2, Processing)
                | (InReview, ChangesMade)
                | (InReview, ReadyToSend)
                | (InReview, Processing)
                | (ChangesMade, ChangesMade)
                | (ChangesMade, ReadyToSend)
                | (ChangesMade, Processing)
                | (ReadyToSend, ChangesMade)
                | (ReadyToSend, Sent)
                | (ReadyToSend, Processing)
                | (Failed, Processing)
        )
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        IssueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PipelineError::General(format!("unknown issue status: {}", s)))
    }
}

/// A state-mutating pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Ingest, bind, score, deduplicate and assign.
    Process,
    /// Generate articles, reclaim leftovers, write the subject line.
    Generate,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Process => "process",
            Phase::Generate => "generate",
        }
    }

    /// Status held while the phase runs.
    pub fn busy_status(&self) -> IssueStatus {
        IssueStatus::Processing
    }

    /// Status the issue rests in after the phase completes.
    pub fn success_status(&self) -> IssueStatus {
        match self {
            Phase::Process => IssueStatus::PendingPhase2,
            Phase::Generate => IssueStatus::InReview,
        }
    }

    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Process => Some(Phase::Generate),
            Phase::Generate => None,
        }
    }

    /// Whether an issue in its current state may enter this phase.
    pub fn accepts(&self, issue: &Issue) -> bool {
        match self {
            Phase::Process => matches!(
                issue.status,
                IssueStatus::Draft
                    | IssueStatus::InReview
                    | IssueStatus::ChangesMade
                    | IssueStatus::ReadyToSend
                    | IssueStatus::Failed
            ),
            Phase::Generate => {
                issue.status == IssueStatus::PendingPhase2
                    || (issue.status == IssueStatus::Failed
                        && issue.failed_phase == Some(Phase::Generate))
            }
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(Phase::Process),
            "generate" => Ok(Phase::Generate),
            other => Err(PipelineError::General(format!("unknown phase: {}", other))),
        }
    }
}

/// Ownership record of the invocation currently running a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseLease {
    pub holder: String,
    pub phase: Phase,
    pub attempt: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PhaseLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Precondition of a guarded issue write.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueGuard {
    pub statuses: Vec<IssueStatus>,
    /// When set, the stored attempt counter must match as well.
    pub attempts: Option<u32>,
}

impl IssueGuard {
    pub fn status(status: IssueStatus) -> Self {
        Self {
            statuses: vec![status],
            attempts: None,
        }
    }

    pub fn exact(status: IssueStatus, attempts: u32) -> Self {
        Self {
            statuses: vec![status],
            attempts: Some(attempts),
        }
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        self.statuses.contains(&issue.status)
            && self.attempts.map_or(true, |attempts| attempts == issue.attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Proceed,
    /// The issue already holds the phase's busy state.
    Conflict,
    /// The issue is elsewhere in its lifecycle; the trigger is stale.
    Skip,
}

pub fn evaluate_guard(issue: &Issue, phase: Phase) -> GuardDecision {
    if issue.status == phase.busy_status() {
        GuardDecision::Conflict
    } else if phase.accepts(issue) {
        GuardDecision::Proceed
    } else {
        GuardDecision::Skip
    }
}

#[derive(Debug, Clone)]
pub enum PhaseStart {
    Started(Issue),
    Conflict(IssueStatus),
    Skipped(IssueStatus),
}

/// Copy of `issue` moved to `to`, with the matching audit timestamp stamped.
pub fn transitioned(issue: &Issue, to: IssueStatus, now: DateTime<Utc>) -> Result<Issue> {
    if !issue.status.can_transition_to(to) {
        return Err(PipelineError::InvalidTransition {
            from: issue.status,
            to,
        });
    }

    let mut next = issue.clone();
    next.status = to;
    next.updated_at = now;

    let audit = &mut next.audit;
    match to {
        IssueStatus::Processing => audit.processing_started_at = Some(now),
        IssueStatus::PendingPhase2 => audit.phase2_pending_at = Some(now),
        IssueStatus::InReview => audit.review_started_at = Some(now),
        IssueStatus::ChangesMade => audit.changes_made_at = Some(now),
        IssueStatus::ReadyToSend => audit.ready_at = Some(now),
        IssueStatus::Sent => audit.sent_at = Some(now),
        IssueStatus::Failed => audit.failed_at = Some(now),
        IssueStatus::Draft => {}
    }

    if to != IssueStatus::Processing {
        next.lease = None;
    }
    if to != IssueStatus::Failed {
        next.failure_reason = None;
        next.failed_phase = None;
    }

    Ok(next)
}

/// Starts a new send cycle. Only one unsent issue may exist per date.
pub async fn create_issue(
    store: &dyn ContentStore,
    publication_id: &str,
    target_date: NaiveDate,
) -> Result<Issue> {
    let issue = Issue::new(publication_id, target_date);
    if !store.insert_issue_if_none_open(&issue).await? {
        return Err(PipelineError::IssueExists { date: target_date });
    }
    info!("Created issue {} for {} ({})", issue.id, target_date, publication_id);
    Ok(issue)
}

/// Re-validates the guard and, if allowed, moves the issue into the phase's
/// busy state under a fresh lease.
pub async fn begin_phase(
    store: &dyn ContentStore,
    issue_id: IssueId,
    phase: Phase,
    holder: &str,
    lease_ttl: Duration,
) -> Result<PhaseStart> {
    for _ in 0..MAX_CAS_RETRIES {
        let issue = store.get_issue(issue_id).await?;

        match evaluate_guard(&issue, phase) {
            GuardDecision::Conflict => {
                debug!("Issue {} already {}, rejecting {}", issue_id, issue.status, phase);
                return Ok(PhaseStart::Conflict(issue.status));
            }
            GuardDecision::Skip => {
                debug!("Issue {} is {}, ignoring stale {} trigger", issue_id, issue.status, phase);
                return Ok(PhaseStart::Skipped(issue.status));
            }
            GuardDecision::Proceed => {}
        }

        let now = Utc::now();
        let mut started = transitioned(&issue, phase.busy_status(), now)?;
        started.attempts = issue.attempts + 1;
        started.lease = Some(PhaseLease {
            holder: holder.to_string(),
            phase,
            attempt: started.attempts,
            acquired_at: now,
            expires_at: now + lease_ttl,
        });

        let guard = IssueGuard::exact(issue.status, issue.attempts);
        if store.compare_and_swap_issue(&guard, &started).await? {
            info!(
                "Issue {} entered {} for {} (attempt {})",
                issue_id, started.status, phase, started.attempts
            );
            return Ok(PhaseStart::Started(started));
        }

        debug!("Lost status race on issue {}, re-reading", issue_id);
    }

    let issue = store.get_issue(issue_id).await?;
    Ok(match evaluate_guard(&issue, phase) {
        GuardDecision::Skip => PhaseStart::Skipped(issue.status),
        _ => PhaseStart::Conflict(issue.status),
    })
}

/// Moves a running issue to the phase's success status. Fails with
/// `LeaseLost` when another actor has changed the issue since `running`.
pub async fn complete_phase(
    store: &dyn ContentStore,
    running: &Issue,
    phase: Phase,
    subject: Option<String>,
) -> Result<Issue> {
    let mut done = transitioned(running, phase.success_status(), Utc::now())?;
    if subject.is_some() {
        done.subject = subject;
    }

    let guard = IssueGuard::exact(phase.busy_status(), running.attempts);
    if !store.compare_and_swap_issue(&guard, &done).await? {
        return Err(PipelineError::LeaseLost {
            issue_id: running.id,
            attempt: running.attempts,
        });
    }

    info!("Issue {} completed {}, now {}", running.id, phase, done.status);
    Ok(done)
}

/// Moves the issue to `failed` with a human-readable reason. When `attempt`
/// is given, only that run's lease may do so.
pub async fn fail_issue(
    store: &dyn ContentStore,
    issue_id: IssueId,
    phase: Option<Phase>,
    attempt: Option<u32>,
    reason: &str,
) -> Result<bool> {
    for _ in 0..MAX_CAS_RETRIES {
        let issue = store.get_issue(issue_id).await?;
        if !issue.status.can_transition_to(IssueStatus::Failed) {
            return Ok(false);
        }
        if let Some(attempt) = attempt {
            if issue.status != IssueStatus::Processing || issue.attempts != attempt {
                warn!("Not failing issue {}: attempt {} no longer holds it", issue_id, attempt);
                return Ok(false);
            }
        }

        let mut failed = transitioned(&issue, IssueStatus::Failed, Utc::now())?;
        failed.failure_reason = Some(reason.to_string());
        failed.failed_phase = phase.or_else(|| issue.lease.as_ref().map(|l| l.phase));

        let guard = IssueGuard::exact(issue.status, issue.attempts);
        if store.compare_and_swap_issue(&guard, &failed).await? {
            warn!("Issue {} failed: {}", issue_id, reason);
            return Ok(true);
        }
    }
    Ok(false)
}

/// Human-driven transitions outside the automated phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    RecordChanges,
    Approve,
    MarkSent,
    Fail { reason: String },
}

impl OperatorAction {
    pub fn parse(name: &str, reason: Option<String>) -> Result<Self> {
        match name {
            "record_changes" => Ok(OperatorAction::RecordChanges),
            "approve" => Ok(OperatorAction::Approve),
            "mark_sent" => Ok(OperatorAction::MarkSent),
            "fail" => Ok(OperatorAction::Fail {
                reason: reason.unwrap_or_else(|| "failed by operator".to_string()),
            }),
            other => Err(PipelineError::General(format!("unknown action: {}", other))),
        }
    }

    fn target(&self) -> IssueStatus {
        match self {
            OperatorAction::RecordChanges => IssueStatus::ChangesMade,
            OperatorAction::Approve => IssueStatus::ReadyToSend,
            OperatorAction::MarkSent => IssueStatus::Sent,
            OperatorAction::Fail { .. } => IssueStatus::Failed,
        }
    }
}

pub async fn apply_action(
    store: &dyn ContentStore,
    issue_id: IssueId,
    action: OperatorAction,
) -> Result<Issue> {
    let target = action.target();

    for _ in 0..MAX_CAS_RETRIES {
        let issue = store.get_issue(issue_id).await?;
        if issue.status == IssueStatus::Processing && target != IssueStatus::Failed {
            return Err(PipelineError::Conflict {
                issue_id,
                status: issue.status,
            });
        }

        let mut next = transitioned(&issue, target, Utc::now())?;
        if let OperatorAction::Fail { reason } = &action {
            next.failure_reason = Some(reason.clone());
            next.failed_phase = issue.lease.as_ref().map(|l| l.phase);
        }

        let guard = IssueGuard::exact(issue.status, issue.attempts);
        if store.compare_and_swap_issue(&guard, &next).await? {
            info!("Issue {} moved {} -> {}", issue_id, issue.status, next.status);
            return Ok(next);
        }
    }

    let issue = store.get_issue(issue_id).await?;
    Err(PipelineError::Conflict {
        issue_id,
        status: issue.status,
    })
}

/// Fails every `processing` issue whose lease has expired, and every
/// `pending_phase2` issue whose generate trigger has not arrived within
/// `trigger_grace`. A failed issue records the phase to retry.
pub async fn recover_stuck(
    store: &dyn ContentStore,
    now: DateTime<Utc>,
    trigger_grace: Duration,
) -> Result<Vec<IssueId>> {
    let mut recovered = Vec::new();

    for issue in store.list_issues_with_status(IssueStatus::Processing).await? {
        let expired = match &issue.lease {
            Some(lease) => lease.is_expired(now),
            None => true,
        };
        if !expired {
            continue;
        }

        let phase = issue.lease.as_ref().map(|l| l.phase);
        let reason = match phase {
            Some(phase) => format!("timeout: {} lease expired without completing", phase),
            None => "timeout: processing without a lease".to_string(),
        };
        if fail_issue(store, issue.id, phase, Some(issue.attempts), &reason).await? {
            recovered.push(issue.id);
        }
    }

    for issue in store.list_issues_with_status(IssueStatus::PendingPhase2).await? {
        let waiting_since = issue.audit.phase2_pending_at.unwrap_or(issue.updated_at);
        if now < waiting_since + trigger_grace {
            continue;
        }

        let mut failed = transitioned(&issue, IssueStatus::Failed, now)?;
        failed.failure_reason = Some(format!(
            "trigger: {} was not started within {} of {} completing",
            Phase::Generate,
            crate::utils::time::format_duration(trigger_grace),
            Phase::Process
        ));
        failed.failed_phase = Some(Phase::Generate);

        // Only the pending state at this attempt; a generate run that started
        // meanwhile keeps the issue.
        let guard = IssueGuard::exact(IssueStatus::PendingPhase2, issue.attempts);
        if store.compare_and_swap_issue(&guard, &failed).await? {
            warn!("Issue {} never received its generate trigger", issue.id);
            recovered.push(issue.id);
        }
    }

    if !recovered.is_empty() {
        info!("Recovered {} stuck issues", recovered.len());
    }
    Ok(recovered)
}
