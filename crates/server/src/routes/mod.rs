use axum::{
    Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{IntoMakeService, get},
};
use tower_http::cors::CorsLayer;

use crate::DeploymentImpl;

pub mod health;
pub mod stream;
pub mod webhooks;
pub mod workflow_states;

/// Handler for the /metrics endpoint that exposes Prometheus metrics
async fn metrics_handler() -> impl IntoResponse {
    match crate::metrics::export_metrics() {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to export metrics: {}", e),
        ),
    }
}

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    let base_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(workflow_states::router(&deployment))
        .merge(stream::router(&deployment))
        .merge(webhooks::router(&deployment))
        .with_state(deployment);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .nest("/api", base_routes)
        .layer(CorsLayer::permissive())
        .into_make_service()
}
