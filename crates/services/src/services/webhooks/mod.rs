//! Webhook Gateway: inbound verification + normalization.
//!
//! Each supported platform gets its own payload type and adapter; everything
//! downstream of the gateway sees only [`NormalizedEvent`]. Signature checks
//! run over the raw request bytes with a constant-time comparison, and a
//! missing shared secret fails closed.

pub mod dispatcher;

pub use dispatcher::WebhookDispatcher;

use chrono::{DateTime, Utc};
use db::models::webhook_endpoint::WebhookEndpointError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use ts_rs::TS;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Webhook secret for platform '{0}' is not configured")]
    MissingSecret(WebhookPlatform),
    #[error("Webhook signature rejected")]
    InvalidSignature,
    #[error("Malformed webhook payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Endpoint returned HTTP {0}")]
    ErrorStatus(u16),
    #[error("Outbound delivery failed: {0}")]
    Delivery(#[from] reqwest::Error),
    #[error(transparent)]
    Endpoint(#[from] WebhookEndpointError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum WebhookPlatform {
    Kajabi,
    Meta,
    N8n,
}

impl std::fmt::Display for WebhookPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookPlatform::Kajabi => write!(f, "kajabi"),
            WebhookPlatform::Meta => write!(f, "meta"),
            WebhookPlatform::N8n => write!(f, "n8n"),
        }
    }
}

/// Canonical event shape every platform delivery is normalized into.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NormalizedEvent {
    pub platform: WebhookPlatform,
    pub event_type: String,
    pub payload: Value,
    pub entry_id: Option<String>,
    pub idempotency_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct KajabiEvent {
    pub id: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct MetaEvent {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<MetaEntry>,
}

#[derive(Debug, Deserialize)]
pub struct MetaEntry {
    pub id: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub changes: Vec<MetaChange>,
}

#[derive(Debug, Deserialize)]
pub struct MetaChange {
    pub field: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct N8nEvent {
    #[serde(alias = "workflowId")]
    pub workflow_id: String,
    #[serde(alias = "executionId")]
    pub execution_id: Option<String>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Tagged union over the platform payload shapes.
#[derive(Debug)]
pub enum PlatformEvent {
    Kajabi(KajabiEvent),
    Meta(MetaEvent),
    N8n(N8nEvent),
}

impl PlatformEvent {
    pub fn parse(platform: WebhookPlatform, body: &str) -> Result<Self, WebhookError> {
        let event = match platform {
            WebhookPlatform::Kajabi => PlatformEvent::Kajabi(serde_json::from_str(body)?),
            WebhookPlatform::Meta => PlatformEvent::Meta(serde_json::from_str(body)?),
            WebhookPlatform::N8n => PlatformEvent::N8n(serde_json::from_str(body)?),
        };
        Ok(event)
    }

    /// Flatten a delivery into canonical events. Meta nests several
    /// sub-events per delivery; the others carry exactly one.
    pub fn normalize(self) -> Vec<NormalizedEvent> {
        match self {
            PlatformEvent::Kajabi(event) => {
                let entry_id = event
                    .payload
                    .get("workflow_id")
                    .and_then(Value::as_str)
                    .map(String::from);
                vec![NormalizedEvent {
                    platform: WebhookPlatform::Kajabi,
                    event_type: event.event,
                    payload: event.payload,
                    entry_id,
                    idempotency_id: event.id,
                    timestamp: event.occurred_at.unwrap_or_else(Utc::now),
                }]
            }
            PlatformEvent::Meta(event) => {
                let object = event.object;
                event
                    .entry
                    .into_iter()
                    .flat_map(|entry| {
                        let entry_id = entry.id;
                        let timestamp = DateTime::from_timestamp(entry.time, 0)
                            .unwrap_or_else(Utc::now);
                        entry
                            .changes
                            .into_iter()
                            .map(|change| NormalizedEvent {
                                platform: WebhookPlatform::Meta,
                                event_type: format!("{}.{}", object, change.field),
                                payload: change.value,
                                entry_id: Some(entry_id.clone()),
                                idempotency_id: format!(
                                    "{}:{}:{}",
                                    entry_id, change.field, entry.time
                                ),
                                timestamp,
                            })
                            .collect::<Vec<_>>()
                    })
                    .collect()
            }
            PlatformEvent::N8n(event) => {
                let idempotency_id = match &event.execution_id {
                    Some(execution_id) => format!("{}:{}", event.workflow_id, execution_id),
                    None => format!("{}:{}", event.workflow_id, event.event),
                };
                vec![NormalizedEvent {
                    platform: WebhookPlatform::N8n,
                    event_type: event.event,
                    payload: event.data,
                    entry_id: Some(event.workflow_id),
                    idempotency_id,
                    timestamp: event.timestamp.unwrap_or_else(Utc::now),
                }]
            }
        }
    }
}

/// HMAC-SHA256 over the raw request bytes. The comparison is constant-time
/// (`Mac::verify_slice`). A missing or empty secret fails closed.
pub fn verify_signature(
    platform: WebhookPlatform,
    secret: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), WebhookError> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or(WebhookError::MissingSecret(platform))?;
    let signature = signature.ok_or(WebhookError::InvalidSignature)?;
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = hex::decode(signature.trim()).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Hex HMAC-SHA256 of `body`, used to sign outbound deliveries and by tests
/// to forge valid inbound signatures.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SECRET: &str = "shared-webhook-secret";

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"id":"evt_1","event":"workflow.started","payload":{}}"#;
        let signature = sign_payload(SECRET, body);

        verify_signature(WebhookPlatform::Kajabi, Some(SECRET), body, Some(&signature))
            .expect("valid signature rejected");

        let prefixed = format!("sha256={}", signature);
        verify_signature(WebhookPlatform::Kajabi, Some(SECRET), body, Some(&prefixed))
            .expect("prefixed signature rejected");
    }

    #[test]
    fn any_single_byte_flip_breaks_verification() {
        let body = br#"{"id":"evt_2","event":"workflow.completed","payload":{"n":1}}"#.to_vec();
        let signature = sign_payload(SECRET, &body);

        for index in 0..body.len() {
            let mut tampered = body.clone();
            tampered[index] ^= 0x01;
            let err = verify_signature(
                WebhookPlatform::Kajabi,
                Some(SECRET),
                &tampered,
                Some(&signature),
            )
            .expect_err("tampered body passed verification");
            assert!(matches!(err, WebhookError::InvalidSignature));
        }
    }

    #[test]
    fn missing_secret_fails_closed() {
        let body = b"{}";
        let signature = sign_payload(SECRET, body);

        let err = verify_signature(WebhookPlatform::Meta, None, body, Some(&signature))
            .expect_err("missing secret must not pass through");
        assert!(matches!(err, WebhookError::MissingSecret(WebhookPlatform::Meta)));

        let err = verify_signature(WebhookPlatform::Meta, Some(""), body, Some(&signature))
            .expect_err("empty secret must not pass through");
        assert!(matches!(err, WebhookError::MissingSecret(WebhookPlatform::Meta)));
    }

    #[test]
    fn absent_or_garbled_header_is_rejected() {
        let body = b"{}";
        assert!(matches!(
            verify_signature(WebhookPlatform::N8n, Some(SECRET), body, None),
            Err(WebhookError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signature(WebhookPlatform::N8n, Some(SECRET), body, Some("not-hex!")),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn meta_delivery_fans_out_per_change() {
        let body = json!({
            "object": "page",
            "entry": [
                {
                    "id": "acct-1",
                    "time": 1714000000,
                    "changes": [
                        {"field": "workflow_started", "value": {"run": 1}},
                        {"field": "workflow_completed", "value": {"run": 1}}
                    ]
                },
                {
                    "id": "acct-2",
                    "time": 1714000060,
                    "changes": [
                        {"field": "leadgen", "value": {"lead_id": "l-9"}}
                    ]
                }
            ]
        })
        .to_string();

        let events = PlatformEvent::parse(WebhookPlatform::Meta, &body)
            .expect("parse failed")
            .normalize();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, "page.workflow_started");
        assert_eq!(events[0].entry_id.as_deref(), Some("acct-1"));
        assert_eq!(events[2].entry_id.as_deref(), Some("acct-2"));

        let ids: std::collections::HashSet<&str> =
            events.iter().map(|e| e.idempotency_id.as_str()).collect();
        assert_eq!(ids.len(), 3, "idempotency ids must be distinct per sub-event");
    }

    #[test]
    fn n8n_accepts_both_field_spellings() {
        let camel = r#"{"workflowId":"wf-7","executionId":"ex-1","event":"workflow.completed","data":{}}"#;
        let snake = r#"{"workflow_id":"wf-7","execution_id":"ex-1","event":"workflow.completed","data":{}}"#;

        for body in [camel, snake] {
            let events = PlatformEvent::parse(WebhookPlatform::N8n, body)
                .expect("parse failed")
                .normalize();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].entry_id.as_deref(), Some("wf-7"));
            assert_eq!(events[0].idempotency_id, "wf-7:ex-1");
        }
    }

    #[test]
    fn kajabi_event_normalizes_to_a_single_event() {
        let body = json!({
            "id": "kjb-123",
            "event": "workflow.started",
            "payload": {"workflow_id": "wf-22", "member": "m-1"},
            "occurred_at": "2026-08-01T10:00:00Z"
        })
        .to_string();

        let events = PlatformEvent::parse(WebhookPlatform::Kajabi, &body)
            .expect("parse failed")
            .normalize();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].idempotency_id, "kjb-123");
        assert_eq!(events[0].entry_id.as_deref(), Some("wf-22"));
        assert_eq!(events[0].event_type, "workflow.started");
    }

    #[test]
    fn unparseable_body_is_a_parse_error() {
        let err = PlatformEvent::parse(WebhookPlatform::Kajabi, "this is not json")
            .expect_err("garbage parsed");
        assert!(matches!(err, WebhookError::Parse(_)));
    }
}
