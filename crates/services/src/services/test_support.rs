use std::str::FromStr;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

pub(crate) async fn setup_pool() -> SqlitePool {
    // Private in-memory database per test; a single pooled connection keeps
    // it alive for the test's duration.
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("invalid sqlite config")
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("failed to open sqlite memory db");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS workflow_states (
            id BLOB PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            current_state TEXT NOT NULL,
            previous_state TEXT,
            execution_id TEXT,
            started_at TEXT,
            completed_at TEXT,
            duration_ms INTEGER,
            progress_percentage INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS state_transitions (
            id BLOB PRIMARY KEY,
            workflow_state_id BLOB NOT NULL REFERENCES workflow_states(id) ON DELETE CASCADE,
            workflow_id TEXT NOT NULL,
            from_state TEXT NOT NULL,
            to_state TEXT NOT NULL,
            transition_type TEXT NOT NULL,
            duration_in_previous_state_ms INTEGER,
            triggered_by TEXT,
            reason TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS webhook_endpoints (
            id BLOB PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'POST',
            is_active INTEGER NOT NULL DEFAULT 1,
            security_mode TEXT NOT NULL DEFAULT 'none',
            security_secret TEXT,
            triggers TEXT NOT NULL DEFAULT '[]',
            retry_attempts INTEGER NOT NULL DEFAULT 3,
            retry_delay_ms INTEGER NOT NULL DEFAULT 1000,
            fallback_action TEXT NOT NULL DEFAULT 'log',
            trigger_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            last_triggered_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .expect("failed to bootstrap schema");
    }

    pool
}
