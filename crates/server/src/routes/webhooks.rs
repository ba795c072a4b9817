//! Webhook ingress (one route family per external platform) and the
//! outbound endpoint registry.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post, put},
};
use chrono::{DateTime, Utc};
use db::models::webhook_endpoint::{CreateWebhookEndpoint, EndpointStatus, WebhookEndpoint};
use deployment::Deployment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use services::services::{
    events::HubStatus,
    webhooks::{
        PlatformEvent, WebhookPlatform,
        dispatcher::{DispatchSummary, EmergencyDispatch, EmergencyOutcome, OrchestrationStatus},
        verify_signature,
    },
};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

const KAJABI_SIGNATURE_HEADER: &str = "x-kajabi-signature";
const META_SIGNATURE_HEADER: &str = "x-hub-signature-256";
const N8N_SIGNATURE_HEADER: &str = "x-n8n-signature";

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct SubEventResult {
    pub idempotency_id: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct IngressOutcome {
    pub success: bool,
    pub message: String,
    pub results: Vec<SubEventResult>,
}

#[derive(Debug, Deserialize)]
pub struct MetaVerifyQuery {
    #[serde(alias = "hub.mode")]
    pub mode: Option<String>,
    #[serde(alias = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(alias = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    #[serde(alias = "workflowId")]
    pub workflow_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(alias = "triggerType")]
    pub trigger_type: String,
}

#[derive(Debug, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RegisterEndpointResponse {
    pub endpoint_id: Uuid,
}

#[derive(Debug, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct DispatchResponse {
    pub success: bool,
    pub summary: DispatchSummary,
}

/// Registry listing entry; never exposes the endpoint secret.
#[derive(Debug, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EndpointView {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub method: String,
    pub status: EndpointStatus,
    pub triggers: Vec<String>,
    pub trigger_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl From<WebhookEndpoint> for EndpointView {
    fn from(endpoint: WebhookEndpoint) -> Self {
        let status = endpoint.status();
        let triggers = serde_json::from_str(&endpoint.triggers).unwrap_or_default();
        Self {
            id: endpoint.id,
            name: endpoint.name,
            url: endpoint.url,
            method: endpoint.method,
            status,
            triggers,
            trigger_count: endpoint.trigger_count,
            success_count: endpoint.success_count,
            error_count: endpoint.error_count,
            last_triggered_at: endpoint.last_triggered_at,
        }
    }
}

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct OrchestrationStatusView {
    pub endpoints: OrchestrationStatus,
    pub stream: HubStatus,
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/webhooks/kajabi", post(kajabi_webhook))
        .route("/webhooks/meta", get(meta_webhook_verify))
        .route("/webhooks/meta", post(meta_webhook))
        .route("/webhooks/n8n", post(n8n_webhook))
        .route("/webhooks/endpoints", put(register_endpoint))
        .route("/webhooks/endpoints", get(list_endpoints))
        .route("/webhooks/dispatch", patch(dispatch_webhook))
        .route("/webhooks/dispatch/priority", post(priority_dispatch))
        .route("/webhooks/status", get(orchestration_status))
}

fn signature_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

/// Shared ingress flow: verify over the raw bytes, parse, normalize, feed
/// every sub-event through the engine. 200 only when all sub-events
/// succeeded; 207 with per-event detail otherwise.
async fn handle_platform_delivery(
    deployment: &DeploymentImpl,
    platform: WebhookPlatform,
    secret: Option<String>,
    signature: Option<String>,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<IngressOutcome>>), ApiError> {
    if let Err(e) = verify_signature(platform, secret.as_deref(), body.as_bytes(), signature.as_deref())
    {
        crate::metrics::WEBHOOKS_REJECTED.inc();
        return Err(e.into());
    }
    crate::metrics::WEBHOOKS_VERIFIED.inc();

    let events = PlatformEvent::parse(platform, &body)?.normalize();
    if events.is_empty() {
        return Ok((
            StatusCode::OK,
            Json(ApiResponse::success(IngressOutcome {
                success: true,
                message: "Delivery contained no events".to_string(),
                results: Vec::new(),
            })),
        ));
    }

    let mut results = Vec::with_capacity(events.len());
    let mut failed = 0;
    for event in &events {
        match deployment.transitions().process_event(event).await {
            Ok(outcome) => results.push(SubEventResult {
                idempotency_id: event.idempotency_id.clone(),
                success: true,
                message: outcome.label().to_string(),
            }),
            Err(e) => {
                failed += 1;
                results.push(SubEventResult {
                    idempotency_id: event.idempotency_id.clone(),
                    success: false,
                    message: e.to_string(),
                });
            }
        }
    }

    let status = if failed == 0 {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    let message = format!("Processed {}/{} events", results.len() - failed, results.len());
    Ok((
        status,
        Json(ApiResponse::success(IngressOutcome {
            success: failed == 0,
            message,
            results,
        })),
    ))
}

async fn kajabi_webhook(
    State(deployment): State<DeploymentImpl>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<IngressOutcome>>), ApiError> {
    let secret = deployment.config().read().await.webhooks.kajabi_secret.clone();
    let signature = signature_header(&headers, KAJABI_SIGNATURE_HEADER);
    handle_platform_delivery(&deployment, WebhookPlatform::Kajabi, secret, signature, body).await
}

/// Meta requires a GET handshake before it will register deliveries: echo
/// the challenge verbatim when the verify token matches.
async fn meta_webhook_verify(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<MetaVerifyQuery>,
) -> impl IntoResponse {
    let expected = deployment
        .config()
        .read()
        .await
        .webhooks
        .meta_verify_token
        .clone();

    match (expected, query.verify_token, query.challenge) {
        (Some(expected), Some(token), Some(challenge)) if token == expected => {
            tracing::info!("Meta webhook verification challenge accepted");
            (StatusCode::OK, challenge).into_response()
        }
        _ => {
            tracing::warn!("Meta webhook verification rejected (mode: {:?})", query.mode);
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn meta_webhook(
    State(deployment): State<DeploymentImpl>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<IngressOutcome>>), ApiError> {
    let secret = deployment.config().read().await.webhooks.meta_secret.clone();
    let signature = signature_header(&headers, META_SIGNATURE_HEADER);
    handle_platform_delivery(&deployment, WebhookPlatform::Meta, secret, signature, body).await
}

async fn n8n_webhook(
    State(deployment): State<DeploymentImpl>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<IngressOutcome>>), ApiError> {
    let secret = deployment.config().read().await.webhooks.n8n_secret.clone();
    let signature = signature_header(&headers, N8N_SIGNATURE_HEADER);
    handle_platform_delivery(&deployment, WebhookPlatform::N8n, secret, signature, body).await
}

async fn register_endpoint(
    State(deployment): State<DeploymentImpl>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<RegisterEndpointResponse>>, ApiError> {
    let data: CreateWebhookEndpoint = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid endpoint registration: {e}")))?;
    let endpoint = deployment.webhooks().register_endpoint(&data).await?;
    Ok(Json(ApiResponse::success(RegisterEndpointResponse {
        endpoint_id: endpoint.id,
    })))
}

async fn list_endpoints(
    State(deployment): State<DeploymentImpl>,
) -> Result<Json<ApiResponse<Vec<EndpointView>>>, ApiError> {
    let endpoints = deployment.webhooks().endpoints().await?;
    let views = endpoints.into_iter().map(EndpointView::from).collect();
    Ok(Json(ApiResponse::success(views)))
}

async fn dispatch_webhook(
    State(deployment): State<DeploymentImpl>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<DispatchResponse>>, ApiError> {
    let request: DispatchRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid dispatch request: {e}")))?;
    let summary = deployment
        .webhooks()
        .dispatch(&request.workflow_id, &request.data, &request.trigger_type)
        .await?;
    Ok(Json(ApiResponse::success(DispatchResponse {
        success: summary.failed == 0,
        summary,
    })))
}

async fn priority_dispatch(
    State(deployment): State<DeploymentImpl>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<EmergencyOutcome>>, ApiError> {
    let request: EmergencyDispatch = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid priority dispatch request: {e}")))?;
    let outcome = deployment.webhooks().emergency_dispatch(&request).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn orchestration_status(
    State(deployment): State<DeploymentImpl>,
) -> Result<Json<ApiResponse<OrchestrationStatusView>>, ApiError> {
    let endpoints = deployment.webhooks().status().await?;
    let stream = deployment.events().status();
    Ok(Json(ApiResponse::success(OrchestrationStatusView {
        endpoints,
        stream,
    })))
}
