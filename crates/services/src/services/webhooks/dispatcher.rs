//! Outbound webhook dispatch with retry, spacing and fallback policy.

use chrono::{Duration as ChronoDuration, Utc};
use db::models::webhook_endpoint::{
    CreateWebhookEndpoint, EndpointStatus, FallbackAction, SecurityMode, WebhookEndpoint,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::{WebhookError, sign_payload};
use crate::services::config::DispatchSettings;

pub const OUTBOUND_SIGNATURE_HEADER: &str = "X-Pulsehub-Signature";

#[derive(Debug, Default, Clone, Serialize, TS)]
#[ts(export)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum DispatchPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Priority dispatch request. Unlike bulk dispatch this may bypass the
/// per-endpoint spacing check and walk a fallback chain.
#[derive(Debug, Clone, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EmergencyDispatch {
    pub endpoint_id: Uuid,
    pub workflow_id: String,
    #[serde(default)]
    pub data: Value,
    pub priority: DispatchPriority,
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub override_conflicts: bool,
    #[serde(default)]
    pub fallback_endpoint_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EmergencyOutcome {
    pub delivered: bool,
    pub delivered_via: Option<Uuid>,
    pub attempted: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct OrchestrationStatus {
    pub total_endpoints: usize,
    pub active: usize,
    pub inactive: usize,
    pub errored: usize,
    pub total_triggers: i64,
    pub total_successes: i64,
    pub total_errors: i64,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    pool: SqlitePool,
    client: reqwest::Client,
    settings: DispatchSettings,
}

impl WebhookDispatcher {
    pub fn new(pool: SqlitePool, settings: DispatchSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .expect("failed to build outbound HTTP client");
        Self {
            pool,
            client,
            settings,
        }
    }

    pub async fn register_endpoint(
        &self,
        data: &CreateWebhookEndpoint,
    ) -> Result<WebhookEndpoint, WebhookError> {
        let endpoint = WebhookEndpoint::create(&self.pool, data).await?;
        info!("Registered webhook endpoint '{}' -> {}", endpoint.name, endpoint.url);
        Ok(endpoint)
    }

    pub async fn endpoints(&self) -> Result<Vec<WebhookEndpoint>, WebhookError> {
        Ok(WebhookEndpoint::find_all(&self.pool).await?)
    }

    fn within_spacing_window(&self, endpoint: &WebhookEndpoint) -> bool {
        let window = ChronoDuration::seconds(self.settings.min_spacing_secs.max(0));
        endpoint
            .last_triggered_at
            .map(|last| Utc::now() - last < window)
            .unwrap_or(false)
    }

    /// Fan a trigger out to every active endpoint whose filters match.
    /// Endpoint failures are folded into counters and the summary; nothing
    /// here raises past the caller.
    pub async fn dispatch(
        &self,
        workflow_id: &str,
        data: &Value,
        trigger_type: &str,
    ) -> Result<DispatchSummary, WebhookError> {
        let endpoints = WebhookEndpoint::find_active(&self.pool).await?;
        let mut summary = DispatchSummary::default();

        for endpoint in endpoints
            .into_iter()
            .filter(|endpoint| endpoint.matches_trigger(trigger_type))
        {
            if self.within_spacing_window(&endpoint) {
                tracing::debug!(
                    "Skipping endpoint '{}' for trigger '{}': inside spacing window",
                    endpoint.name,
                    trigger_type
                );
                summary.skipped += 1;
                continue;
            }

            summary.attempted += 1;
            let body = json!({
                "workflow_id": workflow_id,
                "trigger_type": trigger_type,
                "data": data,
                "dispatched_at": Utc::now(),
            });
            if self.deliver_with_retry(&endpoint, &body, None).await {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        Ok(summary)
    }

    /// Priority path: tries the primary endpoint, then each fallback in
    /// order, until one delivery succeeds. `override_conflicts` bypasses the
    /// spacing check; `max_delay_ms` caps the retry delay.
    pub async fn emergency_dispatch(
        &self,
        request: &EmergencyDispatch,
    ) -> Result<EmergencyOutcome, WebhookError> {
        let mut chain = vec![request.endpoint_id];
        chain.extend(request.fallback_endpoint_ids.iter().copied());

        let body = json!({
            "workflow_id": request.workflow_id,
            "trigger_type": "priority",
            "priority": request.priority,
            "data": request.data,
            "dispatched_at": Utc::now(),
        });

        let mut attempted = Vec::new();
        for endpoint_id in chain {
            let Some(endpoint) = WebhookEndpoint::find_by_id(&self.pool, endpoint_id).await? else {
                warn!("Priority dispatch skipping unknown endpoint {}", endpoint_id);
                continue;
            };
            if !endpoint.is_active {
                continue;
            }
            if !request.override_conflicts && self.within_spacing_window(&endpoint) {
                continue;
            }

            attempted.push(endpoint_id);
            if self
                .deliver_with_retry(&endpoint, &body, request.max_delay_ms)
                .await
            {
                return Ok(EmergencyOutcome {
                    delivered: true,
                    delivered_via: Some(endpoint_id),
                    attempted,
                });
            }
        }

        error!(
            "Priority dispatch for workflow '{}' exhausted {} endpoint(s)",
            request.workflow_id,
            attempted.len()
        );
        Ok(EmergencyOutcome {
            delivered: false,
            delivered_via: None,
            attempted,
        })
    }

    async fn deliver_with_retry(
        &self,
        endpoint: &WebhookEndpoint,
        body: &Value,
        max_delay_ms: Option<u64>,
    ) -> bool {
        if let Err(e) = WebhookEndpoint::record_attempt(&self.pool, endpoint.id, Utc::now()).await {
            warn!("Failed to stamp attempt on endpoint '{}': {}", endpoint.name, e);
        }

        let attempts = endpoint.retry_attempts.max(0) as u64;
        let mut delay = endpoint.retry_delay_ms.max(0) as u64;
        if let Some(cap) = max_delay_ms {
            delay = delay.min(cap);
        }

        for attempt in 0..=attempts {
            if attempt > 0 {
                sleep(Duration::from_millis(delay)).await;
            }
            match self.execute(endpoint, body).await {
                Ok(()) => {
                    if let Err(e) = WebhookEndpoint::record_success(&self.pool, endpoint.id).await {
                        warn!("Failed to record success on endpoint '{}': {}", endpoint.name, e);
                    }
                    info!("Delivered webhook to '{}'", endpoint.name);
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Delivery attempt {}/{} to '{}' failed: {}",
                        attempt + 1,
                        attempts + 1,
                        endpoint.name,
                        e
                    );
                }
            }
        }

        if let Err(e) = WebhookEndpoint::record_failure(&self.pool, endpoint.id).await {
            warn!("Failed to record failure on endpoint '{}': {}", endpoint.name, e);
        }
        match endpoint.fallback_action {
            FallbackAction::Log => {
                error!(
                    "Webhook endpoint '{}' exhausted {} attempt(s); delivery dropped",
                    endpoint.name,
                    attempts + 1
                );
            }
            FallbackAction::Disable => {
                warn!(
                    "Webhook endpoint '{}' exhausted {} attempt(s); disabling it",
                    endpoint.name,
                    attempts + 1
                );
                if let Err(e) = WebhookEndpoint::set_active(&self.pool, endpoint.id, false).await {
                    warn!("Failed to disable endpoint '{}': {}", endpoint.name, e);
                }
            }
        }
        false
    }

    async fn execute(&self, endpoint: &WebhookEndpoint, body: &Value) -> Result<(), WebhookError> {
        let method =
            Method::from_bytes(endpoint.method.as_bytes()).unwrap_or(Method::POST);
        let mut request = self.client.request(method, &endpoint.url).json(body);

        match endpoint.security_mode {
            SecurityMode::None => {}
            SecurityMode::Bearer => {
                if let Some(secret) = &endpoint.security_secret {
                    request = request.bearer_auth(secret);
                }
            }
            SecurityMode::HmacSha256 => {
                if let Some(secret) = &endpoint.security_secret {
                    let raw = serde_json::to_vec(body)?;
                    request = request.header(
                        OUTBOUND_SIGNATURE_HEADER,
                        format!("sha256={}", sign_payload(secret, &raw)),
                    );
                }
            }
        }

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WebhookError::ErrorStatus(response.status().as_u16()))
        }
    }

    /// Orchestration summary over the endpoint registry.
    pub async fn status(&self) -> Result<OrchestrationStatus, WebhookError> {
        let endpoints = WebhookEndpoint::find_all(&self.pool).await?;
        let mut status = OrchestrationStatus {
            total_endpoints: endpoints.len(),
            active: 0,
            inactive: 0,
            errored: 0,
            total_triggers: 0,
            total_successes: 0,
            total_errors: 0,
        };
        for endpoint in &endpoints {
            match endpoint.status() {
                EndpointStatus::Active => status.active += 1,
                EndpointStatus::Inactive => status.inactive += 1,
                EndpointStatus::Error => status.errored += 1,
            }
            status.total_triggers += endpoint.trigger_count;
            status.total_successes += endpoint.success_count;
            status.total_errors += endpoint.error_count;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use db::models::webhook_endpoint::{EndpointErrorHandling, EndpointSecurity};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::services::test_support::setup_pool;

    fn settings() -> DispatchSettings {
        DispatchSettings {
            timeout_secs: 2,
            min_spacing_secs: 3600,
        }
    }

    fn endpoint_data(name: &str, url: &str, triggers: Vec<String>) -> CreateWebhookEndpoint {
        CreateWebhookEndpoint {
            name: name.to_string(),
            url: url.to_string(),
            method: "POST".to_string(),
            security: None,
            triggers,
            error_handling: EndpointErrorHandling {
                retry_attempts: 1,
                retry_delay_ms: 1,
                fallback_action: FallbackAction::Log,
            },
        }
    }

    /// One-shot HTTP responder: accepts a single connection, consumes the
    /// request, answers 200.
    async fn spawn_ok_responder() -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("no local addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        format!("http://{}/hook", addr)
    }

    #[tokio::test]
    async fn successful_delivery_updates_counters() {
        let pool = setup_pool().await;
        let dispatcher = WebhookDispatcher::new(pool.clone(), settings());
        let url = spawn_ok_responder().await;
        let endpoint = dispatcher
            .register_endpoint(&endpoint_data("happy", &url, vec![]))
            .await
            .expect("register failed");

        let summary = dispatcher
            .dispatch("wf-1", &json!({"k": "v"}), "complete")
            .await
            .expect("dispatch failed");
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);

        let reloaded = WebhookEndpoint::find_by_id(&pool, endpoint.id)
            .await
            .expect("lookup failed")
            .expect("missing endpoint");
        assert_eq!(reloaded.trigger_count, 1);
        assert_eq!(reloaded.success_count, 1);
        assert_eq!(reloaded.error_count, 0);
        assert!(reloaded.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_run_the_fallback_action() {
        let pool = setup_pool().await;
        let dispatcher = WebhookDispatcher::new(pool.clone(), settings());
        // Nothing listens on this port; connections are refused immediately.
        let endpoint = dispatcher
            .register_endpoint(&endpoint_data("dead", "http://127.0.0.1:9/hook", vec![]))
            .await
            .expect("register failed");

        let summary = dispatcher
            .dispatch("wf-2", &json!({}), "fail")
            .await
            .expect("dispatch failed");
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.failed, 1);

        let reloaded = WebhookEndpoint::find_by_id(&pool, endpoint.id)
            .await
            .expect("lookup failed")
            .expect("missing endpoint");
        assert_eq!(reloaded.error_count, 1);
        assert_eq!(reloaded.success_count, 0);
        assert_eq!(reloaded.status(), EndpointStatus::Error);
    }

    #[tokio::test]
    async fn trigger_filters_scope_the_fan_out() {
        let pool = setup_pool().await;
        let dispatcher = WebhookDispatcher::new(pool.clone(), settings());
        dispatcher
            .register_endpoint(&endpoint_data(
                "completions-only",
                "http://127.0.0.1:9/hook",
                vec!["complete".to_string()],
            ))
            .await
            .expect("register failed");

        let summary = dispatcher
            .dispatch("wf-3", &json!({}), "start")
            .await
            .expect("dispatch failed");
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn spacing_window_skips_recently_triggered_endpoints() {
        let pool = setup_pool().await;
        let dispatcher = WebhookDispatcher::new(pool.clone(), settings());
        let endpoint = dispatcher
            .register_endpoint(&endpoint_data("paced", "http://127.0.0.1:9/hook", vec![]))
            .await
            .expect("register failed");

        WebhookEndpoint::record_attempt(&pool, endpoint.id, Utc::now())
            .await
            .expect("attempt stamp failed");

        let summary = dispatcher
            .dispatch("wf-4", &json!({}), "start")
            .await
            .expect("dispatch failed");
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn emergency_dispatch_overrides_spacing_and_walks_fallbacks() {
        let pool = setup_pool().await;
        let dispatcher = WebhookDispatcher::new(pool.clone(), settings());

        let primary = dispatcher
            .register_endpoint(&endpoint_data("primary", "http://127.0.0.1:9/hook", vec![]))
            .await
            .expect("register failed");
        let url = spawn_ok_responder().await;
        let fallback = dispatcher
            .register_endpoint(&endpoint_data("fallback", &url, vec![]))
            .await
            .expect("register failed");

        // Both endpoints were just triggered; only override_conflicts gets
        // the priority path past the spacing check.
        for id in [primary.id, fallback.id] {
            WebhookEndpoint::record_attempt(&pool, id, Utc::now())
                .await
                .expect("attempt stamp failed");
        }

        let blocked = dispatcher
            .emergency_dispatch(&EmergencyDispatch {
                endpoint_id: primary.id,
                workflow_id: "wf-5".to_string(),
                data: json!({}),
                priority: DispatchPriority::Critical,
                max_delay_ms: Some(1),
                override_conflicts: false,
                fallback_endpoint_ids: vec![fallback.id],
            })
            .await
            .expect("emergency dispatch failed");
        assert!(!blocked.delivered);
        assert!(blocked.attempted.is_empty());

        let outcome = dispatcher
            .emergency_dispatch(&EmergencyDispatch {
                endpoint_id: primary.id,
                workflow_id: "wf-5".to_string(),
                data: json!({"urgent": true}),
                priority: DispatchPriority::Critical,
                max_delay_ms: Some(1),
                override_conflicts: true,
                fallback_endpoint_ids: vec![fallback.id],
            })
            .await
            .expect("emergency dispatch failed");
        assert!(outcome.delivered);
        assert_eq!(outcome.delivered_via, Some(fallback.id));
        assert_eq!(outcome.attempted, vec![primary.id, fallback.id]);
    }

    #[tokio::test]
    async fn hmac_endpoints_sign_the_outgoing_body() {
        let pool = setup_pool().await;
        let dispatcher = WebhookDispatcher::new(pool.clone(), settings());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("no local addr");
        let received = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept failed");
            let mut buf = vec![0u8; 16384];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let mut data = endpoint_data("signed", &format!("http://{}/hook", addr), vec![]);
        data.security = Some(EndpointSecurity {
            mode: SecurityMode::HmacSha256,
            secret: Some("egress-secret".to_string()),
        });
        dispatcher
            .register_endpoint(&data)
            .await
            .expect("register failed");

        let summary = dispatcher
            .dispatch("wf-6", &json!({"k": 1}), "complete")
            .await
            .expect("dispatch failed");
        assert_eq!(summary.succeeded, 1);

        let request = received.await.expect("responder task failed");
        assert!(request.to_lowercase().contains("x-pulsehub-signature: sha256="));
    }
}
