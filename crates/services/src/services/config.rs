//! Process configuration: a versioned JSON file under the asset directory,
//! with environment variables taking precedence for secrets so they never
//! have to live on disk.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

/// Shared secrets for inbound webhook signature verification, one per
/// supported platform. Missing secrets fail closed at the gateway.
#[derive(Clone, Debug, Default, Serialize, Deserialize, TS)]
pub struct WebhookSecrets {
    pub kajabi_secret: Option<String>,
    pub meta_secret: Option<String>,
    pub meta_verify_token: Option<String>,
    pub n8n_secret: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct StreamSettings {
    /// HS256 secret for verifying stream tokens. Connects are rejected when
    /// unset — the hub never falls back to accepting arbitrary tokens.
    pub auth_secret: Option<String>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_channels")]
    pub default_channels: Vec<String>,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_channels() -> Vec<String> {
    vec![
        "insights".to_string(),
        "alerts".to_string(),
        "forecasts".to_string(),
    ]
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            auth_secret: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            default_channels: default_channels(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct RetentionSettings {
    #[serde(default = "default_retention_days")]
    pub default_days_old: i64,
    #[serde(default)]
    pub sweep_enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_retention_days() -> i64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            default_days_old: default_retention_days(),
            sweep_enabled: false,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct DispatchSettings {
    /// Bound on every outbound webhook call so a slow endpoint cannot pin a
    /// retry slot.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum spacing between non-priority dispatches to one endpoint.
    #[serde(default = "default_min_spacing_secs")]
    pub min_spacing_secs: i64,
}

fn default_dispatch_timeout_secs() -> u64 {
    10
}

fn default_min_spacing_secs() -> i64 {
    2
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_dispatch_timeout_secs(),
            min_spacing_secs: default_min_spacing_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct Config {
    pub config_version: String,
    #[serde(default)]
    pub webhooks: WebhookSecrets,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: "v1".to_string(),
            webhooks: WebhookSecrets::default(),
            stream: StreamSettings::default(),
            retention: RetentionSettings::default(),
            dispatch: DispatchSettings::default(),
        }
    }
}

impl Config {
    /// Environment wins over the file for anything secret-shaped.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("KAJABI_WEBHOOK_SECRET") {
            self.webhooks.kajabi_secret = Some(secret);
        }
        if let Ok(secret) = std::env::var("META_WEBHOOK_SECRET") {
            self.webhooks.meta_secret = Some(secret);
        }
        if let Ok(token) = std::env::var("META_VERIFY_TOKEN") {
            self.webhooks.meta_verify_token = Some(token);
        }
        if let Ok(secret) = std::env::var("N8N_WEBHOOK_SECRET") {
            self.webhooks.n8n_secret = Some(secret);
        }
        if let Ok(secret) = std::env::var("STREAM_AUTH_SECRET") {
            self.stream.auth_secret = Some(secret);
        }
        if let Ok(days) = std::env::var("PULSEHUB_RETENTION_DAYS")
            && let Ok(days) = days.parse::<i64>()
        {
            self.retention.default_days_old = days;
        }
        if let Ok(enabled) = std::env::var("PULSEHUB_RETENTION_SWEEP")
            && let Ok(enabled) = enabled.parse::<bool>()
        {
            self.retention.sweep_enabled = enabled;
        }
    }
}

/// Read the config file, falling back to defaults when it is missing or no
/// longer parses. Env overrides are applied on top either way.
pub async fn load_config_from_file(path: &Path) -> Config {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(raw) => match serde_json::from_str::<Config>(&raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config at {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Config::default()
            }
        },
        Err(_) => Config::default(),
    };
    config.apply_env_overrides();
    config
}

pub async fn save_config_to_file(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let raw = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}
