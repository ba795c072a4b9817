//! Outbound webhook endpoint registry.
//!
//! Every dispatch attempt mutates the delivery counters; `status` is derived,
//! never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WebhookEndpointError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Webhook endpoint not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "webhook_security_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SecurityMode {
    None,
    Bearer,
    HmacSha256,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "webhook_fallback_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum FallbackAction {
    Log,
    Disable,
}

/// Derived endpoint health, computed from the counters on read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum EndpointStatus {
    Active,
    Inactive,
    Error,
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityMode::None => write!(f, "none"),
            SecurityMode::Bearer => write!(f, "bearer"),
            SecurityMode::HmacSha256 => write!(f, "hmac_sha256"),
        }
    }
}

impl std::fmt::Display for FallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackAction::Log => write!(f, "log"),
            FallbackAction::Disable => write!(f, "disable"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub method: String,
    pub is_active: bool,
    pub security_mode: SecurityMode,
    pub security_secret: Option<String>,
    pub triggers: String, // JSON list of trigger-type filters
    pub retry_attempts: i64,
    pub retry_delay_ms: i64,
    pub fallback_action: FallbackAction,
    pub trigger_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EndpointSecurity {
    pub mode: SecurityMode,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EndpointErrorHandling {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: i64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: i64,
    #[serde(default = "default_fallback_action")]
    pub fallback_action: FallbackAction,
}

fn default_retry_attempts() -> i64 {
    3
}

fn default_retry_delay_ms() -> i64 {
    1000
}

fn default_fallback_action() -> FallbackAction {
    FallbackAction::Log
}

impl Default for EndpointErrorHandling {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            fallback_action: default_fallback_action(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CreateWebhookEndpoint {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub security: Option<EndpointSecurity>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub error_handling: EndpointErrorHandling,
}

fn default_method() -> String {
    "POST".to_string()
}

impl WebhookEndpoint {
    pub fn status(&self) -> EndpointStatus {
        if !self.is_active {
            EndpointStatus::Inactive
        } else if self.error_count > self.success_count {
            EndpointStatus::Error
        } else {
            EndpointStatus::Active
        }
    }

    /// Whether this endpoint wants `trigger_type`. An endpoint with no
    /// filters receives every trigger.
    pub fn matches_trigger(&self, trigger_type: &str) -> bool {
        let filters: Vec<String> = serde_json::from_str(&self.triggers).unwrap_or_default();
        filters.is_empty() || filters.iter().any(|f| f == trigger_type || f == "*")
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateWebhookEndpoint,
    ) -> Result<Self, WebhookEndpointError> {
        let id = Uuid::new_v4();
        let (security_mode, security_secret) = match &data.security {
            Some(security) => (security.mode, security.secret.clone()),
            None => (SecurityMode::None, None),
        };
        let triggers = serde_json::to_string(&data.triggers).unwrap_or_else(|_| "[]".to_string());
        let security_mode_str = security_mode.to_string();
        let fallback_str = data.error_handling.fallback_action.to_string();

        let endpoint = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            INSERT INTO webhook_endpoints (
                id, name, url, method, security_mode, security_secret,
                triggers, retry_attempts, retry_delay_ms, fallback_action
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.url)
        .bind(&data.method)
        .bind(security_mode_str)
        .bind(security_secret)
        .bind(triggers)
        .bind(data.error_handling.retry_attempts)
        .bind(data.error_handling.retry_delay_ms)
        .bind(fallback_str)
        .fetch_one(pool)
        .await?;

        Ok(endpoint)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, WebhookEndpointError> {
        let endpoint =
            sqlx::query_as::<_, WebhookEndpoint>("SELECT * FROM webhook_endpoints WHERE id = ?1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(endpoint)
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, WebhookEndpointError> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints ORDER BY created_at ASC",
        )
        .fetch_all(pool)
        .await?;
        Ok(endpoints)
    }

    pub async fn find_active(pool: &SqlitePool) -> Result<Vec<Self>, WebhookEndpointError> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints WHERE is_active = 1 ORDER BY created_at ASC",
        )
        .fetch_all(pool)
        .await?;
        Ok(endpoints)
    }

    /// Stamp an attempt: bumps `trigger_count` and `last_triggered_at`.
    pub async fn record_attempt(
        pool: &SqlitePool,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookEndpointError> {
        sqlx::query(
            r#"
            UPDATE webhook_endpoints SET
                trigger_count = trigger_count + 1,
                last_triggered_at = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn record_success(pool: &SqlitePool, id: Uuid) -> Result<(), WebhookEndpointError> {
        sqlx::query(
            r#"
            UPDATE webhook_endpoints SET
                success_count = success_count + 1,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn record_failure(pool: &SqlitePool, id: Uuid) -> Result<(), WebhookEndpointError> {
        sqlx::query(
            r#"
            UPDATE webhook_endpoints SET
                error_count = error_count + 1,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_active(
        pool: &SqlitePool,
        id: Uuid,
        is_active: bool,
    ) -> Result<(), WebhookEndpointError> {
        sqlx::query(
            r#"
            UPDATE webhook_endpoints SET
                is_active = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(is_active)
        .execute(pool)
        .await?;
        Ok(())
    }
}
