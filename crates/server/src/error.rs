use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::{
    state_transition::StateTransitionError, webhook_endpoint::WebhookEndpointError,
    workflow_state::WorkflowStateError,
};
use deployment::DeploymentError;
use services::services::{
    config::ConfigError, events::EventError, transitions::TransitionError, webhooks::WebhookError,
};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    WorkflowState(#[from] WorkflowStateError),
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),
    #[error(transparent)]
    WebhookEndpoint(#[from] WebhookEndpointError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::WorkflowState(err) => match err {
                WorkflowStateError::NotFound => (StatusCode::NOT_FOUND, "WorkflowStateError"),
                WorkflowStateError::Conflict(_) => (StatusCode::CONFLICT, "WorkflowStateError"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "WorkflowStateError"),
            },
            ApiError::StateTransition(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "StateTransitionError")
            }
            ApiError::WebhookEndpoint(err) => match err {
                WebhookEndpointError::NotFound => (StatusCode::NOT_FOUND, "WebhookEndpointError"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "WebhookEndpointError"),
            },
            ApiError::Transition(err) => match err {
                TransitionError::InvalidState(_) | TransitionError::InvalidTransitionType(_) => {
                    (StatusCode::BAD_REQUEST, "TransitionError")
                }
                TransitionError::NotFound(_) => (StatusCode::NOT_FOUND, "TransitionError"),
                TransitionError::Conflict(_) => (StatusCode::CONFLICT, "TransitionError"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "TransitionError"),
            },
            ApiError::Event(err) => match err {
                EventError::ClientNotFound(_) | EventError::Closed(_) => {
                    (StatusCode::NOT_FOUND, "EventError")
                }
                // Fail closed: an unconfigured verifier rejects, it never
                // waves connections through.
                EventError::AuthNotConfigured | EventError::Unauthorized => {
                    (StatusCode::UNAUTHORIZED, "EventError")
                }
            },
            ApiError::Webhook(err) => match err {
                WebhookError::MissingSecret(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "WebhookError")
                }
                WebhookError::InvalidSignature => (StatusCode::UNAUTHORIZED, "WebhookError"),
                WebhookError::Parse(_) => (StatusCode::BAD_REQUEST, "WebhookError"),
                WebhookError::Endpoint(WebhookEndpointError::NotFound) => {
                    (StatusCode::NOT_FOUND, "WebhookError")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "WebhookError"),
            },
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "ConflictError"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let error_message = match &self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Conflict(msg)
            | ApiError::InternalError(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };

        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
