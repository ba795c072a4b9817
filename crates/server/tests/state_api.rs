use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use deployment::Deployment;
use serde_json::{Value, json};
use server::{DeploymentImpl, routes};
use services::services::webhooks::sign_payload;
use tower::{Service, ServiceExt};

const KAJABI_SECRET: &str = "test-kajabi-secret";

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response body was not JSON")
}

fn post_state(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/state")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("failed to build request")
}

#[tokio::test]
async fn state_api_lifecycle() {
    let asset_dir = tempfile::tempdir().expect("tempdir");
    // SAFETY: single-threaded at this point; no other test in this binary
    // reads the environment concurrently.
    unsafe {
        std::env::set_var("PULSEHUB_ASSET_DIR", asset_dir.path());
        std::env::set_var("KAJABI_WEBHOOK_SECRET", KAJABI_SECRET);
    }

    let deployment = DeploymentImpl::new().await.expect("deployment init failed");
    let mut make_service = routes::router(deployment);
    let router = make_service.call(()).await.expect("router build failed");

    // Missing identifiers are the caller's mistake.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/state")
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // First transition creates the row running with started_at stamped.
    let response = router
        .clone()
        .oneshot(post_state(json!({
            "workflow_id": "wf1",
            "new_state": "running",
            "transition_type": "start"
        })))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["transition"], json!("created"));
    assert_eq!(body["data"]["state"]["current_state"], json!("running"));
    assert!(!body["data"]["state"]["started_at"].is_null());

    // Completing the same workflow updates it and stamps completion.
    let response = router
        .clone()
        .oneshot(post_state(json!({
            "workflow_id": "wf1",
            "new_state": "completed",
            "transition_type": "complete"
        })))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["transition"], json!("updated"));
    assert_eq!(body["data"]["state"]["previous_state"], json!("running"));
    assert!(!body["data"]["state"]["completed_at"].is_null());
    assert!(body["data"]["state"]["duration_ms"].is_i64());

    // Values outside the enums are a 400, not a 500.
    let response = router
        .clone()
        .oneshot(post_state(json!({
            "workflow_id": "wf1",
            "new_state": "sideways",
            "transition_type": "start"
        })))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Single read with history.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/state?workflow_id=wf1&include_history=true&include_aggregates=true")
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(
        body["data"]["history"].as_array().map(|h| h.len()),
        Some(2)
    );
    assert_eq!(body["data"]["aggregates"]["total_transitions"], json!(2));

    // Unknown workflow is a 404.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/state?workflow_id=ghost")
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Fresh terminal row is inside the retention window; nothing to delete.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/state?days_old=30")
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["deleted_count"], json!(0));
    assert!(!body["data"]["cutoff_date"].is_null());

    // A tampered webhook body is rejected before any processing.
    let delivery = json!({
        "id": "kjb-900",
        "event": "workflow.started",
        "payload": {"workflow_id": "wf-hook"}
    })
    .to_string();
    let signature = sign_payload(KAJABI_SECRET, delivery.as_bytes());
    let mut tampered = delivery.clone().into_bytes();
    tampered[0] ^= 0x01;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/kajabi")
                .header("content-type", "application/json")
                .header("x-kajabi-signature", &signature)
                .body(Body::from(tampered))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/state?workflow_id=wf-hook")
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The untouched body with the same signature goes through and applies
    // the transition.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/kajabi")
                .header("content-type", "application/json")
                .header("x-kajabi-signature", &signature)
                .body(Body::from(delivery))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["success"], json!(true));

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/state?workflow_id=wf-hook")
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["state"]["current_state"], json!("running"));
}
