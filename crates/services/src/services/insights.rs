//! In-memory facade over the upstream analytics engine.
//!
//! The engine itself is an external collaborator; this service only caches
//! the data needed for the stream bootstrap burst (current forecasts, active
//! alerts, engine status) and accepts injected refreshes via the control
//! channel.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Forecast {
    pub metric: String,
    pub values: Value,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EngineStatus {
    pub online: bool,
    pub subscriber_count: usize,
    pub forecast_count: usize,
    pub active_alert_count: usize,
    pub last_refresh: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
#[ts(export)]
pub enum InjectOutcome {
    Forecast(String),
    Alert(Uuid),
    Raw,
}

#[derive(Clone)]
pub struct InsightsService {
    forecasts: Arc<DashMap<String, Forecast>>,
    alerts: Arc<DashMap<Uuid, Alert>>,
    subscribers: Arc<AtomicUsize>,
    last_refresh: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl InsightsService {
    pub fn new() -> Self {
        Self {
            forecasts: Arc::new(DashMap::new()),
            alerts: Arc::new(DashMap::new()),
            subscribers: Arc::new(AtomicUsize::new(0)),
            last_refresh: Arc::new(RwLock::new(None)),
        }
    }

    pub fn subscribe(&self) {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unsubscribe(&self) {
        let _ = self
            .subscribers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn current_forecasts(&self) -> Vec<Forecast> {
        self.forecasts
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            online: true,
            subscriber_count: self.subscribers.load(Ordering::Relaxed),
            forecast_count: self.forecasts.len(),
            active_alert_count: self.alerts.len(),
            last_refresh: *self.last_refresh.read().expect("last_refresh lock poisoned"),
        }
    }

    /// Accept a data refresh pushed over the control channel. A payload with
    /// a `metric` key upserts a forecast; one with `alert` raises an alert;
    /// anything else is passed through for broadcast only.
    pub fn inject(&self, payload: &Value) -> InjectOutcome {
        let now = Utc::now();
        *self.last_refresh.write().expect("last_refresh lock poisoned") = Some(now);

        if let Some(metric) = payload.get("metric").and_then(Value::as_str) {
            let forecast = Forecast {
                metric: metric.to_string(),
                values: payload
                    .get("values")
                    .cloned()
                    .unwrap_or_else(|| payload.clone()),
                generated_at: now,
            };
            self.forecasts.insert(metric.to_string(), forecast);
            return InjectOutcome::Forecast(metric.to_string());
        }

        if let Some(alert) = payload.get("alert") {
            let severity = match alert.get("severity").and_then(Value::as_str) {
                Some("critical") => AlertSeverity::Critical,
                Some("info") => AlertSeverity::Info,
                _ => AlertSeverity::Warning,
            };
            let id = Uuid::new_v4();
            self.alerts.insert(
                id,
                Alert {
                    id,
                    severity,
                    message: alert
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified alert")
                        .to_string(),
                    raised_at: now,
                },
            );
            return InjectOutcome::Alert(id);
        }

        InjectOutcome::Raw
    }
}

impl Default for InsightsService {
    fn default() -> Self {
        Self::new()
    }
}
