use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use db::models::workflow_state::WorkflowState;
use deployment::Deployment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use services::services::transitions::{TransitionOutcome, TransitionRequest};
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    pub workflow_id: Option<String>,
    /// Comma-separated list for bulk reads.
    pub workflow_ids: Option<String>,
    pub include_history: Option<bool>,
    pub include_aggregates: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub days_old: Option<i64>,
    pub workflow_id: Option<String>,
}

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct TransitionResponse {
    pub state: WorkflowState,
    pub transition: TransitionOutcome,
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new().route(
        "/state",
        get(get_state).post(post_transition).delete(cleanup_states),
    )
}

async fn get_state(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<StateQuery>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let include_history = query.include_history.unwrap_or(false);
    let include_aggregates = query.include_aggregates.unwrap_or(false);

    if let Some(raw_ids) = query.workflow_ids {
        let workflow_ids: Vec<String> = raw_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
        if workflow_ids.is_empty() {
            return Err(ApiError::BadRequest("workflow_ids must not be empty".to_string()));
        }
        let view = deployment
            .transitions()
            .get_states(&workflow_ids, include_aggregates)
            .await?;
        let data = serde_json::to_value(view)
            .map_err(|e| ApiError::InternalError(format!("Failed to serialize response: {e}")))?;
        return Ok(Json(ApiResponse::success(data)));
    }

    let workflow_id = query
        .workflow_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("workflow_id or workflow_ids is required".to_string()))?;
    let view = deployment
        .transitions()
        .get_state(&workflow_id, include_history, include_aggregates)
        .await?;
    let data = serde_json::to_value(view)
        .map_err(|e| ApiError::InternalError(format!("Failed to serialize response: {e}")))?;
    Ok(Json(ApiResponse::success(data)))
}

async fn post_transition(
    State(deployment): State<DeploymentImpl>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<TransitionResponse>>, ApiError> {
    // Parsed by hand so missing/invalid fields surface as a 400, not a
    // generic extractor rejection.
    let request: TransitionRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid transition request: {e}")))?;

    let applied = deployment.transitions().apply_transition(&request).await?;
    crate::metrics::TRANSITIONS_APPLIED.inc();

    Ok(Json(ApiResponse::success(TransitionResponse {
        state: applied.state,
        transition: applied.transition,
    })))
}

async fn cleanup_states(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let outcome = deployment
        .transitions()
        .cleanup(query.days_old, query.workflow_id.as_deref())
        .await?;
    let data = serde_json::to_value(outcome)
        .map_err(|e| ApiError::InternalError(format!("Failed to serialize response: {e}")))?;
    Ok(Json(ApiResponse::success(data)))
}
