//! Append-only transition audit log. Rows are never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use crate::models::workflow_state::WorkflowStateKind;

/// History reads are capped; callers never page the full log.
pub const HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "transition_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum TransitionType {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
    Retry,
    Schedule,
    Reset,
}

impl TransitionType {
    pub const ALL: [TransitionType; 9] = [
        TransitionType::Start,
        TransitionType::Pause,
        TransitionType::Resume,
        TransitionType::Complete,
        TransitionType::Fail,
        TransitionType::Cancel,
        TransitionType::Retry,
        TransitionType::Schedule,
        TransitionType::Reset,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(TransitionType::Start),
            "pause" => Some(TransitionType::Pause),
            "resume" => Some(TransitionType::Resume),
            "complete" => Some(TransitionType::Complete),
            "fail" => Some(TransitionType::Fail),
            "cancel" => Some(TransitionType::Cancel),
            "retry" => Some(TransitionType::Retry),
            "schedule" => Some(TransitionType::Schedule),
            "reset" => Some(TransitionType::Reset),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionType::Start => write!(f, "start"),
            TransitionType::Pause => write!(f, "pause"),
            TransitionType::Resume => write!(f, "resume"),
            TransitionType::Complete => write!(f, "complete"),
            TransitionType::Fail => write!(f, "fail"),
            TransitionType::Cancel => write!(f, "cancel"),
            TransitionType::Retry => write!(f, "retry"),
            TransitionType::Schedule => write!(f, "schedule"),
            TransitionType::Reset => write!(f, "reset"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StateTransition {
    pub id: Uuid,
    pub workflow_state_id: Uuid,
    pub workflow_id: String,
    pub from_state: WorkflowStateKind,
    pub to_state: WorkflowStateKind,
    pub transition_type: TransitionType,
    pub duration_in_previous_state_ms: Option<i64>,
    pub triggered_by: Option<String>,
    pub reason: Option<String>,
    pub metadata: String, // JSON payload
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateStateTransition {
    pub workflow_state_id: Uuid,
    pub workflow_id: String,
    pub from_state: WorkflowStateKind,
    pub to_state: WorkflowStateKind,
    pub transition_type: TransitionType,
    pub duration_in_previous_state_ms: Option<i64>,
    pub triggered_by: Option<String>,
    pub reason: Option<String>,
    pub metadata: String,
}

impl StateTransition {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateStateTransition,
        now: DateTime<Utc>,
    ) -> Result<Self, StateTransitionError> {
        let id = Uuid::new_v4();
        let from_state = data.from_state.to_string();
        let to_state = data.to_state.to_string();
        let transition_type = data.transition_type.to_string();

        let transition = sqlx::query_as::<_, StateTransition>(
            r#"
            INSERT INTO state_transitions (
                id, workflow_state_id, workflow_id, from_state, to_state,
                transition_type, duration_in_previous_state_ms, triggered_by,
                reason, metadata, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.workflow_state_id)
        .bind(&data.workflow_id)
        .bind(from_state)
        .bind(to_state)
        .bind(transition_type)
        .bind(data.duration_in_previous_state_ms)
        .bind(&data.triggered_by)
        .bind(&data.reason)
        .bind(&data.metadata)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(transition)
    }

    /// Most recent transitions for a workflow, newest first, capped at
    /// [`HISTORY_LIMIT`].
    pub async fn find_recent(
        pool: &SqlitePool,
        workflow_id: &str,
    ) -> Result<Vec<Self>, StateTransitionError> {
        let transitions = sqlx::query_as::<_, StateTransition>(
            r#"
            SELECT * FROM state_transitions
            WHERE workflow_id = ?1
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(workflow_id)
        .bind(HISTORY_LIMIT)
        .fetch_all(pool)
        .await?;

        Ok(transitions)
    }

    /// Parse metadata as generic JSON.
    pub fn metadata_json(&self) -> Option<Value> {
        serde_json::from_str(&self.metadata).ok()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::{
        test_utils::setup_test_pool,
        workflow_state::{StateSnapshot, WorkflowState},
    };

    async fn seed_state(pool: &SqlitePool, workflow_id: &str) -> WorkflowState {
        let snapshot = StateSnapshot {
            current_state: WorkflowStateKind::Running,
            previous_state: Some(WorkflowStateKind::Idle),
            execution_id: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            progress_percentage: 0,
            metadata: "{}".to_string(),
        };
        WorkflowState::create(pool, workflow_id, &snapshot, Utc::now())
            .await
            .expect("failed to seed workflow state")
    }

    #[tokio::test]
    async fn audit_log_append_and_capped_read() {
        let pool = setup_test_pool().await;
        let state = seed_state(&pool, "wf-audit").await;
        let base = Utc::now();

        for i in 0..(HISTORY_LIMIT + 10) {
            StateTransition::create(
                &pool,
                &CreateStateTransition {
                    workflow_state_id: state.id,
                    workflow_id: "wf-audit".to_string(),
                    from_state: WorkflowStateKind::Running,
                    to_state: WorkflowStateKind::Paused,
                    transition_type: TransitionType::Pause,
                    duration_in_previous_state_ms: Some(i),
                    triggered_by: None,
                    reason: None,
                    metadata: "{}".to_string(),
                },
                base + Duration::milliseconds(i),
            )
            .await
            .expect("append failed");
        }

        let recent = StateTransition::find_recent(&pool, "wf-audit")
            .await
            .expect("read failed");
        assert_eq!(recent.len(), HISTORY_LIMIT as usize);
        // Newest first
        assert_eq!(recent[0].duration_in_previous_state_ms, Some(HISTORY_LIMIT + 9));
    }

    #[tokio::test]
    async fn transition_record_round_trips_fields() {
        let pool = setup_test_pool().await;
        let state = seed_state(&pool, "wf-fields").await;

        let created = StateTransition::create(
            &pool,
            &CreateStateTransition {
                workflow_state_id: state.id,
                workflow_id: "wf-fields".to_string(),
                from_state: WorkflowStateKind::Idle,
                to_state: WorkflowStateKind::Running,
                transition_type: TransitionType::Start,
                duration_in_previous_state_ms: None,
                triggered_by: Some("scheduler".to_string()),
                reason: Some("campaign launch".to_string()),
                metadata: r#"{"campaign":"spring"}"#.to_string(),
            },
            Utc::now(),
        )
        .await
        .expect("append failed");

        assert_eq!(created.from_state, WorkflowStateKind::Idle);
        assert_eq!(created.to_state, WorkflowStateKind::Running);
        assert_eq!(created.transition_type, TransitionType::Start);
        assert_eq!(created.triggered_by.as_deref(), Some("scheduler"));
        assert_eq!(
            created.metadata_json().and_then(|m| m["campaign"].as_str().map(String::from)),
            Some("spring".to_string())
        );
    }
}
