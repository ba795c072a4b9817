//! Transition Engine.
//!
//! Validates and applies workflow state transitions, computes elapsed
//! durations, persists the snapshot + audit record, and fans the result out
//! to the broadcast hub and the outbound dispatcher. Fan-out is fire-and-
//! forget: the caller's response never blocks on downstream delivery.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use db::models::{
    state_transition::{CreateStateTransition, StateTransition, StateTransitionError},
    webhook_endpoint::WebhookEndpointError,
    workflow_state::{StateSnapshot, WorkflowAggregate, WorkflowState, WorkflowStateError, WorkflowStateKind},
};
use db::models::state_transition::TransitionType;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};
use ts_rs::TS;

use crate::services::{
    config::RetentionSettings,
    events::EventService,
    webhooks::{NormalizedEvent, WebhookDispatcher},
};

/// Hub channel that receives a `data` message for every applied transition.
pub const WORKFLOW_CHANNEL: &str = "workflows";

const IDEMPOTENCY_CACHE_CAPACITY: u64 = 10_000;
const IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("'{0}' is not a recognized workflow state")]
    InvalidState(String),
    #[error("'{0}' is not a recognized transition type")]
    InvalidTransitionType(String),
    #[error("No workflow state recorded for '{0}'")]
    NotFound(String),
    #[error("Concurrent transition lost the race for workflow '{0}'")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<WorkflowStateError> for TransitionError {
    fn from(err: WorkflowStateError) -> Self {
        match err {
            WorkflowStateError::Database(e) => TransitionError::Database(e),
            WorkflowStateError::Conflict(workflow_id) => TransitionError::Conflict(workflow_id),
            WorkflowStateError::NotFound => TransitionError::NotFound("unknown".to_string()),
        }
    }
}

impl From<StateTransitionError> for TransitionError {
    fn from(err: StateTransitionError) -> Self {
        match err {
            StateTransitionError::Database(e) => TransitionError::Database(e),
        }
    }
}

impl From<WebhookEndpointError> for TransitionError {
    fn from(err: WebhookEndpointError) -> Self {
        match err {
            WebhookEndpointError::Database(e) => TransitionError::Database(e),
            WebhookEndpointError::NotFound => TransitionError::NotFound("endpoint".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, TS)]
#[ts(export)]
pub struct TransitionRequest {
    pub workflow_id: String,
    pub new_state: String,
    pub transition_type: String,
    pub execution_id: Option<String>,
    pub progress: Option<i64>,
    pub metadata: Option<Value>,
    pub triggered_by: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum TransitionOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct AppliedTransition {
    pub state: WorkflowState,
    pub transition: TransitionOutcome,
    pub record: StateTransition,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct StateView {
    pub state: WorkflowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<StateTransition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregates: Option<WorkflowAggregate>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct BulkStateView {
    pub states: HashMap<String, WorkflowState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregates: Option<HashMap<String, WorkflowAggregate>>,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct CleanupOutcome {
    pub deleted_count: u64,
    pub cutoff_date: DateTime<Utc>,
}

/// What happened to one normalized inbound event.
#[derive(Debug)]
pub enum ProcessOutcome {
    Applied(Box<AppliedTransition>),
    BroadcastOnly,
    Duplicate,
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Applied(_) => "applied",
            ProcessOutcome::BroadcastOnly => "broadcast",
            ProcessOutcome::Duplicate => "duplicate",
        }
    }
}

#[derive(Clone)]
pub struct TransitionService {
    pool: SqlitePool,
    events: EventService,
    dispatcher: WebhookDispatcher,
    retention: RetentionSettings,
    seen: Cache<String, ()>,
}

impl TransitionService {
    pub fn new(
        pool: SqlitePool,
        events: EventService,
        dispatcher: WebhookDispatcher,
        retention: RetentionSettings,
    ) -> Self {
        let seen = Cache::builder()
            .max_capacity(IDEMPOTENCY_CACHE_CAPACITY)
            .time_to_live(std::time::Duration::from_secs(IDEMPOTENCY_TTL_SECS))
            .build();
        Self {
            pool,
            events,
            dispatcher,
            retention,
            seen,
        }
    }

    /// Apply one transition. Values outside the enums are rejected before
    /// anything is read; any enumerated pair is accepted regardless of the
    /// current state.
    pub async fn apply_transition(
        &self,
        request: &TransitionRequest,
    ) -> Result<AppliedTransition, TransitionError> {
        let new_state = WorkflowStateKind::parse(&request.new_state)
            .ok_or_else(|| TransitionError::InvalidState(request.new_state.clone()))?;
        let transition_type = TransitionType::parse(&request.transition_type)
            .ok_or_else(|| TransitionError::InvalidTransitionType(request.transition_type.clone()))?;

        let now = Utc::now();
        let current = WorkflowState::find_current(&self.pool, &request.workflow_id).await?;

        let (state, outcome, from_state, duration_in_previous) = match current {
            None => {
                let started_at = (new_state == WorkflowStateKind::Running).then_some(now);
                let (completed_at, duration_ms) = if new_state.is_terminal() {
                    // Terminal on first sight: no prior start to measure from.
                    (Some(now), Some(0))
                } else {
                    (None, None)
                };
                let snapshot = StateSnapshot {
                    current_state: new_state,
                    previous_state: Some(WorkflowStateKind::Idle),
                    execution_id: request.execution_id.clone(),
                    started_at,
                    completed_at,
                    duration_ms,
                    progress_percentage: request.progress.unwrap_or(0).clamp(0, 100),
                    metadata: merge_metadata("{}", request.metadata.as_ref()),
                };
                let state =
                    WorkflowState::create(&self.pool, &request.workflow_id, &snapshot, now).await?;
                (state, TransitionOutcome::Created, WorkflowStateKind::Idle, None)
            }
            Some(row) => {
                let duration_in_previous = (now - row.updated_at).num_milliseconds().max(0);
                let started_at = row
                    .started_at
                    .or_else(|| (new_state == WorkflowStateKind::Running).then_some(now));
                let (completed_at, duration_ms) = if new_state.is_terminal() {
                    (Some(now), started_at.map(|s| (now - s).num_milliseconds()))
                } else {
                    (row.completed_at, row.duration_ms)
                };
                let snapshot = StateSnapshot {
                    current_state: new_state,
                    previous_state: Some(row.current_state),
                    execution_id: request.execution_id.clone().or_else(|| row.execution_id.clone()),
                    started_at,
                    completed_at,
                    duration_ms,
                    progress_percentage: request
                        .progress
                        .unwrap_or(row.progress_percentage)
                        .clamp(0, 100),
                    metadata: merge_metadata(&row.metadata, request.metadata.as_ref()),
                };
                let from_state = row.current_state;
                let state =
                    WorkflowState::update(&self.pool, row.id, row.version, &snapshot, now).await?;
                (state, TransitionOutcome::Updated, from_state, Some(duration_in_previous))
            }
        };

        let record = StateTransition::create(
            &self.pool,
            &CreateStateTransition {
                workflow_state_id: state.id,
                workflow_id: request.workflow_id.clone(),
                from_state,
                to_state: new_state,
                transition_type,
                duration_in_previous_state_ms: duration_in_previous,
                triggered_by: request.triggered_by.clone(),
                reason: request.reason.clone(),
                metadata: merge_metadata("{}", request.metadata.as_ref()),
            },
            now,
        )
        .await?;

        info!(
            "Workflow '{}' transitioned {} -> {} ({})",
            request.workflow_id, record.from_state, record.to_state, record.transition_type
        );

        let applied = AppliedTransition {
            state,
            transition: outcome,
            record,
        };
        self.fan_out(&applied);
        Ok(applied)
    }

    /// Hub push + outbound dispatch, detached from the caller.
    fn fan_out(&self, applied: &AppliedTransition) {
        let payload = json!({
            "workflow_id": applied.state.workflow_id,
            "state": applied.state,
            "transition": applied.record,
        });

        let events = self.events.clone();
        let hub_payload = payload.clone();
        tokio::spawn(async move {
            events
                .broadcast_to_channels(&[WORKFLOW_CHANNEL.to_string()], hub_payload)
                .await;
        });

        let dispatcher = self.dispatcher.clone();
        let workflow_id = applied.state.workflow_id.clone();
        let trigger_type = applied.record.transition_type.to_string();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(&workflow_id, &payload, &trigger_type).await {
                warn!("Outbound dispatch for workflow '{}' failed: {}", workflow_id, e);
            }
        });
    }

    /// Feed one normalized inbound event through the engine. Deliveries with
    /// an already-seen idempotency id are acknowledged without re-applying
    /// side effects. Events that do not map onto a transition are broadcast
    /// only.
    pub async fn process_event(
        &self,
        event: &NormalizedEvent,
    ) -> Result<ProcessOutcome, TransitionError> {
        if self.seen.get(&event.idempotency_id).await.is_some() {
            debug!("Ignoring duplicate delivery {}", event.idempotency_id);
            return Ok(ProcessOutcome::Duplicate);
        }

        let outcome = match (map_event_type(&event.event_type), event.entry_id.as_deref()) {
            (Some((new_state, transition_type)), Some(workflow_id)) => {
                let request = TransitionRequest {
                    workflow_id: workflow_id.to_string(),
                    new_state: new_state.to_string(),
                    transition_type: transition_type.to_string(),
                    execution_id: None,
                    progress: None,
                    metadata: Some(json!({
                        "platform": event.platform,
                        "event_type": event.event_type,
                    })),
                    triggered_by: Some(format!("webhook:{}", event.platform)),
                    reason: None,
                };
                ProcessOutcome::Applied(Box::new(self.apply_transition(&request).await?))
            }
            _ => {
                self.events
                    .broadcast_to_channels(
                        &["insights".to_string()],
                        json!({
                            "platform": event.platform,
                            "event_type": event.event_type,
                            "payload": event.payload,
                        }),
                    )
                    .await;
                ProcessOutcome::BroadcastOnly
            }
        };

        self.seen.insert(event.idempotency_id.clone(), ()).await;
        Ok(outcome)
    }

    pub async fn get_state(
        &self,
        workflow_id: &str,
        include_history: bool,
        include_aggregates: bool,
    ) -> Result<StateView, TransitionError> {
        let state = WorkflowState::find_current(&self.pool, workflow_id)
            .await?
            .ok_or_else(|| TransitionError::NotFound(workflow_id.to_string()))?;

        let history = if include_history {
            Some(StateTransition::find_recent(&self.pool, workflow_id).await?)
        } else {
            None
        };
        let aggregates = if include_aggregates {
            WorkflowState::aggregate(&self.pool, workflow_id).await?
        } else {
            None
        };

        Ok(StateView {
            state,
            history,
            aggregates,
        })
    }

    /// Bulk read: latest snapshot per id. Unknown ids are omitted rather
    /// than failing the whole request.
    pub async fn get_states(
        &self,
        workflow_ids: &[String],
        include_aggregates: bool,
    ) -> Result<BulkStateView, TransitionError> {
        let states = WorkflowState::find_current_many(&self.pool, workflow_ids).await?;

        let aggregates = if include_aggregates {
            let mut map = HashMap::new();
            for state in &states {
                if let Some(aggregate) =
                    WorkflowState::aggregate(&self.pool, &state.workflow_id).await?
                {
                    map.insert(state.workflow_id.clone(), aggregate);
                }
            }
            Some(map)
        } else {
            None
        };

        let states = states
            .into_iter()
            .map(|state| (state.workflow_id.clone(), state))
            .collect();

        Ok(BulkStateView { states, aggregates })
    }

    /// Remove terminal rows older than the cutoff, optionally scoped to one
    /// workflow. `days_old` falls back to the configured retention default.
    pub async fn cleanup(
        &self,
        days_old: Option<i64>,
        workflow_id: Option<&str>,
    ) -> Result<CleanupOutcome, TransitionError> {
        let days = days_old.unwrap_or(self.retention.default_days_old).max(0);
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let deleted_count = WorkflowState::cleanup_terminal(&self.pool, cutoff, workflow_id).await?;
        if deleted_count > 0 {
            info!(
                "Retention cleanup removed {} terminal workflow state(s) older than {}",
                deleted_count, cutoff
            );
        }
        Ok(CleanupOutcome {
            deleted_count,
            cutoff_date: cutoff,
        })
    }
}

/// Shallow merge of a metadata update into the stored bag; new keys win.
fn merge_metadata(existing: &str, update: Option<&Value>) -> String {
    let mut base: Map<String, Value> = serde_json::from_str::<Value>(existing)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    if let Some(Value::Object(update)) = update {
        for (key, value) in update {
            base.insert(key.clone(), value.clone());
        }
    }
    Value::Object(base).to_string()
}

/// Map an external event type onto a `(state, transition)` pair by its final
/// segment. Unmapped types flow through as broadcast-only events.
pub fn map_event_type(event_type: &str) -> Option<(WorkflowStateKind, TransitionType)> {
    let suffix = event_type
        .rsplit(['.', '_'])
        .next()
        .unwrap_or(event_type);
    match suffix {
        "started" | "start" => Some((WorkflowStateKind::Running, TransitionType::Start)),
        "completed" | "complete" | "finished" | "succeeded" => {
            Some((WorkflowStateKind::Completed, TransitionType::Complete))
        }
        "failed" | "fail" | "error" | "errored" => {
            Some((WorkflowStateKind::Failed, TransitionType::Fail))
        }
        "paused" => Some((WorkflowStateKind::Paused, TransitionType::Pause)),
        "resumed" => Some((WorkflowStateKind::Running, TransitionType::Resume)),
        "cancelled" | "canceled" => Some((WorkflowStateKind::Cancelled, TransitionType::Cancel)),
        "retrying" | "retry" | "retried" => {
            Some((WorkflowStateKind::Retrying, TransitionType::Retry))
        }
        "scheduled" => Some((WorkflowStateKind::Scheduled, TransitionType::Schedule)),
        "reset" => Some((WorkflowStateKind::Idle, TransitionType::Reset)),
        _ => None,
    }
}
