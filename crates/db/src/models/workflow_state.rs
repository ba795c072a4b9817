//! Workflow state snapshots.
//!
//! One row per workflow instance snapshot; the "current" state of a
//! `workflow_id` is the row with the greatest `updated_at`. History rows are
//! never mutated — every transition rewrites the latest snapshot (guarded by
//! an optimistic `version` counter) and appends a `state_transitions` record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkflowStateError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Workflow state not found")]
    NotFound,
    #[error("Concurrent transition lost the race for workflow '{0}'")]
    Conflict(String),
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[sqlx(type_name = "workflow_state_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum WorkflowStateKind {
    Idle,
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    Scheduled,
}

impl WorkflowStateKind {
    pub const ALL: [WorkflowStateKind; 9] = [
        WorkflowStateKind::Idle,
        WorkflowStateKind::Pending,
        WorkflowStateKind::Running,
        WorkflowStateKind::Paused,
        WorkflowStateKind::Completed,
        WorkflowStateKind::Failed,
        WorkflowStateKind::Cancelled,
        WorkflowStateKind::Retrying,
        WorkflowStateKind::Scheduled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStateKind::Completed | WorkflowStateKind::Failed | WorkflowStateKind::Cancelled
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(WorkflowStateKind::Idle),
            "pending" => Some(WorkflowStateKind::Pending),
            "running" => Some(WorkflowStateKind::Running),
            "paused" => Some(WorkflowStateKind::Paused),
            "completed" => Some(WorkflowStateKind::Completed),
            "failed" => Some(WorkflowStateKind::Failed),
            "cancelled" => Some(WorkflowStateKind::Cancelled),
            "retrying" => Some(WorkflowStateKind::Retrying),
            "scheduled" => Some(WorkflowStateKind::Scheduled),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStateKind::Idle => write!(f, "idle"),
            WorkflowStateKind::Pending => write!(f, "pending"),
            WorkflowStateKind::Running => write!(f, "running"),
            WorkflowStateKind::Paused => write!(f, "paused"),
            WorkflowStateKind::Completed => write!(f, "completed"),
            WorkflowStateKind::Failed => write!(f, "failed"),
            WorkflowStateKind::Cancelled => write!(f, "cancelled"),
            WorkflowStateKind::Retrying => write!(f, "retrying"),
            WorkflowStateKind::Scheduled => write!(f, "scheduled"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct WorkflowState {
    pub id: Uuid,
    pub workflow_id: String,
    pub current_state: WorkflowStateKind,
    pub previous_state: Option<WorkflowStateKind>,
    pub execution_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub progress_percentage: i64,
    pub metadata: String, // JSON bag
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field values for the latest snapshot, computed by the transition engine.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub current_state: WorkflowStateKind,
    pub previous_state: Option<WorkflowStateKind>,
    pub execution_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub progress_percentage: i64,
    pub metadata: String,
}

/// Per-workflow rollup recomputed from the transition log and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct WorkflowAggregate {
    pub workflow_id: String,
    pub state_counts: HashMap<String, i64>,
    pub total_transitions: i64,
    pub average_duration_ms: Option<f64>,
    pub success_rate: Option<f64>,
}

impl WorkflowState {
    /// Parse the metadata column as generic JSON.
    pub fn metadata_json(&self) -> Option<Value> {
        serde_json::from_str(&self.metadata).ok()
    }

    /// Latest snapshot for a workflow, by `updated_at` (version breaks ties).
    pub async fn find_current(
        pool: &SqlitePool,
        workflow_id: &str,
    ) -> Result<Option<Self>, WorkflowStateError> {
        let state = sqlx::query_as::<_, WorkflowState>(
            r#"
            SELECT * FROM workflow_states
            WHERE workflow_id = ?1
            ORDER BY updated_at DESC, version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(pool)
        .await?;

        Ok(state)
    }

    /// Latest snapshot per workflow id; ids with no rows are omitted.
    pub async fn find_current_many(
        pool: &SqlitePool,
        workflow_ids: &[String],
    ) -> Result<Vec<Self>, WorkflowStateError> {
        let mut states = Vec::with_capacity(workflow_ids.len());
        for workflow_id in workflow_ids {
            if let Some(state) = Self::find_current(pool, workflow_id).await? {
                states.push(state);
            }
        }
        Ok(states)
    }

    pub async fn create(
        pool: &SqlitePool,
        workflow_id: &str,
        snapshot: &StateSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowStateError> {
        let id = Uuid::new_v4();
        let current = snapshot.current_state.to_string();
        let previous = snapshot.previous_state.map(|s| s.to_string());

        let state = sqlx::query_as::<_, WorkflowState>(
            r#"
            INSERT INTO workflow_states (
                id, workflow_id, current_state, previous_state, execution_id,
                started_at, completed_at, duration_ms, progress_percentage,
                metadata, version, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(workflow_id)
        .bind(current)
        .bind(previous)
        .bind(&snapshot.execution_id)
        .bind(snapshot.started_at)
        .bind(snapshot.completed_at)
        .bind(snapshot.duration_ms)
        .bind(snapshot.progress_percentage)
        .bind(&snapshot.metadata)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(state)
    }

    /// Conditional snapshot rewrite. Fails with `Conflict` when another
    /// transition bumped `version` since the caller read the row.
    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        expected_version: i64,
        snapshot: &StateSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowStateError> {
        let current = snapshot.current_state.to_string();
        let previous = snapshot.previous_state.map(|s| s.to_string());

        let state = sqlx::query_as::<_, WorkflowState>(
            r#"
            UPDATE workflow_states SET
                current_state = ?3,
                previous_state = ?4,
                execution_id = ?5,
                started_at = ?6,
                completed_at = ?7,
                duration_ms = ?8,
                progress_percentage = ?9,
                metadata = ?10,
                version = version + 1,
                updated_at = ?11
            WHERE id = ?1 AND version = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(current)
        .bind(previous)
        .bind(&snapshot.execution_id)
        .bind(snapshot.started_at)
        .bind(snapshot.completed_at)
        .bind(snapshot.duration_ms)
        .bind(snapshot.progress_percentage)
        .bind(&snapshot.metadata)
        .bind(now)
        .fetch_optional(pool)
        .await?;

        match state {
            Some(state) => Ok(state),
            None => {
                let lost = sqlx::query_as::<_, WorkflowState>(
                    "SELECT * FROM workflow_states WHERE id = ?1",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?;
                match lost {
                    Some(row) => Err(WorkflowStateError::Conflict(row.workflow_id)),
                    None => Err(WorkflowStateError::NotFound),
                }
            }
        }
    }

    /// Delete terminal-state rows strictly older than `cutoff`. A row whose
    /// `updated_at` equals the cutoff survives.
    pub async fn cleanup_terminal(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
        workflow_id: Option<&str>,
    ) -> Result<u64, WorkflowStateError> {
        let result = match workflow_id {
            Some(workflow_id) => {
                sqlx::query(
                    r#"
                    DELETE FROM workflow_states
                    WHERE current_state IN ('completed', 'failed', 'cancelled')
                      AND updated_at < ?1
                      AND workflow_id = ?2
                    "#,
                )
                .bind(cutoff)
                .bind(workflow_id)
                .execute(pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM workflow_states
                    WHERE current_state IN ('completed', 'failed', 'cancelled')
                      AND updated_at < ?1
                    "#,
                )
                .bind(cutoff)
                .execute(pool)
                .await?
            }
        };

        Ok(result.rows_affected())
    }

    /// Recompute the read-only rollup for one workflow from the transition
    /// log plus snapshot durations. Returns `None` when the workflow has no
    /// recorded transitions.
    pub async fn aggregate(
        pool: &SqlitePool,
        workflow_id: &str,
    ) -> Result<Option<WorkflowAggregate>, WorkflowStateError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT to_state, COUNT(*) FROM state_transitions
            WHERE workflow_id = ?1
            GROUP BY to_state
            "#,
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut state_counts = HashMap::new();
        let mut total_transitions = 0;
        for (state, count) in rows {
            total_transitions += count;
            state_counts.insert(state, count);
        }

        let average_duration_ms = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT AVG(duration_ms) FROM workflow_states
            WHERE workflow_id = ?1 AND duration_ms IS NOT NULL
            "#,
        )
        .bind(workflow_id)
        .fetch_one(pool)
        .await?;

        let completed = state_counts.get("completed").copied().unwrap_or(0);
        let terminal = completed
            + state_counts.get("failed").copied().unwrap_or(0)
            + state_counts.get("cancelled").copied().unwrap_or(0);
        let success_rate = if terminal > 0 {
            Some(completed as f64 / terminal as f64)
        } else {
            None
        };

        Ok(Some(WorkflowAggregate {
            workflow_id: workflow_id.to_string(),
            state_counts,
            total_transitions,
            average_duration_ms,
            success_rate,
        }))
    }

    #[cfg(test)]
    pub(crate) async fn set_updated_at(
        pool: &SqlitePool,
        id: Uuid,
        updated_at: DateTime<Utc>,
    ) -> Result<(), WorkflowStateError> {
        sqlx::query("UPDATE workflow_states SET updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(updated_at)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::test_utils::setup_test_pool;

    fn snapshot(state: WorkflowStateKind) -> StateSnapshot {
        StateSnapshot {
            current_state: state,
            previous_state: Some(WorkflowStateKind::Idle),
            execution_id: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            progress_percentage: 0,
            metadata: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let pool = setup_test_pool().await;
        let now = Utc::now();

        let first =
            WorkflowState::create(&pool, "wf-latest", &snapshot(WorkflowStateKind::Running), now)
                .await
                .expect("create failed");

        let mut later = snapshot(WorkflowStateKind::Paused);
        later.previous_state = Some(WorkflowStateKind::Running);
        WorkflowState::update(&pool, first.id, first.version, &later, now + Duration::seconds(5))
            .await
            .expect("update failed");

        let current = WorkflowState::find_current(&pool, "wf-latest")
            .await
            .expect("lookup failed")
            .expect("missing row");
        assert_eq!(current.current_state, WorkflowStateKind::Paused);
        assert_eq!(current.previous_state, Some(WorkflowStateKind::Running));
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let pool = setup_test_pool().await;
        let now = Utc::now();

        let row =
            WorkflowState::create(&pool, "wf-race", &snapshot(WorkflowStateKind::Running), now)
                .await
                .expect("create failed");

        WorkflowState::update(&pool, row.id, row.version, &snapshot(WorkflowStateKind::Paused), now)
            .await
            .expect("first writer should win");

        let err = WorkflowState::update(
            &pool,
            row.id,
            row.version,
            &snapshot(WorkflowStateKind::Cancelled),
            now,
        )
        .await
        .expect_err("second writer should lose");
        assert!(matches!(err, WorkflowStateError::Conflict(_)));
    }

    #[tokio::test]
    async fn retention_cutoff_is_exclusive() {
        let pool = setup_test_pool().await;
        let cutoff = Utc::now() - Duration::days(30);

        let mut terminal = snapshot(WorkflowStateKind::Completed);
        terminal.completed_at = Some(cutoff);
        let at_cutoff = WorkflowState::create(&pool, "wf-at-cutoff", &terminal, cutoff)
            .await
            .expect("create failed");
        WorkflowState::set_updated_at(&pool, at_cutoff.id, cutoff)
            .await
            .expect("timestamp override failed");

        let just_older = WorkflowState::create(&pool, "wf-older", &terminal, cutoff)
            .await
            .expect("create failed");
        WorkflowState::set_updated_at(&pool, just_older.id, cutoff - Duration::milliseconds(1))
            .await
            .expect("timestamp override failed");

        let running = WorkflowState::create(
            &pool,
            "wf-running",
            &snapshot(WorkflowStateKind::Running),
            cutoff - Duration::days(10),
        )
        .await
        .expect("create failed");
        WorkflowState::set_updated_at(&pool, running.id, cutoff - Duration::days(10))
            .await
            .expect("timestamp override failed");

        let deleted = WorkflowState::cleanup_terminal(&pool, cutoff, None)
            .await
            .expect("cleanup failed");
        assert_eq!(deleted, 1);

        assert!(WorkflowState::find_current(&pool, "wf-at-cutoff")
            .await
            .expect("lookup failed")
            .is_some());
        assert!(WorkflowState::find_current(&pool, "wf-older")
            .await
            .expect("lookup failed")
            .is_none());
        assert!(WorkflowState::find_current(&pool, "wf-running")
            .await
            .expect("lookup failed")
            .is_some());
    }

    #[tokio::test]
    async fn cleanup_scoped_to_one_workflow() {
        let pool = setup_test_pool().await;
        let cutoff = Utc::now() - Duration::days(30);
        let stale = cutoff - Duration::days(5);

        for workflow_id in ["wf-scope-a", "wf-scope-b"] {
            let row =
                WorkflowState::create(&pool, workflow_id, &snapshot(WorkflowStateKind::Failed), stale)
                    .await
                    .expect("create failed");
            WorkflowState::set_updated_at(&pool, row.id, stale)
                .await
                .expect("timestamp override failed");
        }

        let deleted = WorkflowState::cleanup_terminal(&pool, cutoff, Some("wf-scope-a"))
            .await
            .expect("cleanup failed");
        assert_eq!(deleted, 1);
        assert!(WorkflowState::find_current(&pool, "wf-scope-b")
            .await
            .expect("lookup failed")
            .is_some());
    }
}
