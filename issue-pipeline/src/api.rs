use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::pipeline::{IssuePipeline, OutcomeKind};
use crate::types::{Issue, IssueId, PhaseTriggerRequest, PhaseTriggerResponse, PipelineError};
use crate::workflow::{OperatorAction, Phase};

pub fn router(pipeline: Arc<IssuePipeline>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/phases/{phase}", post(run_phase))
        .route("/issues", post(create_issue))
        .route("/issues/{id}", get(get_issue))
        .route("/issues/{id}/actions/{action}", post(apply_action))
        .route("/maintenance/recover", post(recover))
        .with_state(pipeline)
}

/// Error body of every non-phase endpoint.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::IssueNotFound { .. } | PipelineError::ItemNotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::Conflict { .. }
        | PipelineError::IssueExists { .. }
        | PipelineError::InvalidTransition { .. }
        | PipelineError::LeaseLost { .. } => StatusCode::CONFLICT,
        PipelineError::PublicationMismatch { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn failure(status: StatusCode, message: String) -> (StatusCode, Json<PhaseTriggerResponse>) {
    (
        status,
        Json(PhaseTriggerResponse {
            success: false,
            message,
            next_phase: None,
            counts: Default::default(),
        }),
    )
}

async fn run_phase(
    State(pipeline): State<Arc<IssuePipeline>>,
    Path(phase): Path<String>,
    Json(request): Json<PhaseTriggerRequest>,
) -> (StatusCode, Json<PhaseTriggerResponse>) {
    let phase: Phase = match phase.parse() {
        Ok(phase) => phase,
        Err(e) => return failure(StatusCode::NOT_FOUND, e.to_string()),
    };

    // The phase owns its task, so a caller that hangs up does not cancel it
    // before its budget or failure handling runs.
    let issue_id = request.issue_id;
    let running = tokio::spawn(async move { pipeline.run_phase(phase, request).await });
    let result = match running.await {
        Ok(result) => result,
        Err(e) => {
            error!("Phase {} task for issue {} aborted: {}", phase, issue_id, e);
            return failure(StatusCode::INTERNAL_SERVER_ERROR, format!("phase task aborted: {}", e));
        }
    };

    match result {
        Ok(outcome) => {
            let status = match outcome.kind {
                OutcomeKind::Completed | OutcomeKind::Skipped => StatusCode::OK,
                OutcomeKind::Conflict => StatusCode::CONFLICT,
                OutcomeKind::Failed => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(outcome.into()))
        }
        Err(e) => failure(status_for(&e), e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateIssueBody {
    date: NaiveDate,
}

async fn create_issue(
    State(pipeline): State<Arc<IssuePipeline>>,
    Json(body): Json<CreateIssueBody>,
) -> Result<(StatusCode, Json<Issue>), ApiError> {
    let issue = pipeline.create_issue(body.date).await?;
    Ok((StatusCode::CREATED, Json(issue)))
}

async fn get_issue(
    State(pipeline): State<Arc<IssuePipeline>>,
    Path(id): Path<IssueId>,
) -> Result<Json<Issue>, ApiError> {
    Ok(Json(pipeline.store().get_issue(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ActionBody {
    reason: Option<String>,
}

async fn apply_action(
    State(pipeline): State<Arc<IssuePipeline>>,
    Path((id, action)): Path<(IssueId, String)>,
    body: Bytes,
) -> Result<Json<Issue>, Response> {
    let bad_request = |message: String| {
        (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": message }))).into_response()
    };

    let body: ActionBody = if body.is_empty() {
        ActionBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?
    };
    let action = OperatorAction::parse(&action, body.reason).map_err(|e| bad_request(e.to_string()))?;

    pipeline
        .apply_action(id, action)
        .await
        .map(Json)
        .map_err(|e| ApiError(e).into_response())
}

#[derive(Debug, Serialize)]
struct RecoverResponse {
    recovered: Vec<IssueId>,
}

async fn recover(State(pipeline): State<Arc<IssuePipeline>>) -> Result<Json<RecoverResponse>, ApiError> {
    let recovered = pipeline.recover_stuck().await?;
    Ok(Json(RecoverResponse { recovered }))
}
