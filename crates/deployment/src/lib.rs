//! The interface-bound service registry. Routes and background tasks depend
//! on this trait, never on concrete service instances or globals.

use std::sync::Arc;

use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::DBService;
use services::services::{
    config::{Config, ConfigError},
    events::EventService,
    insights::InsightsService,
    sentry::SentryService,
    transitions::TransitionService,
    webhooks::WebhookDispatcher,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::{sync::RwLock, task::JoinHandle, time::Duration};

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn config(&self) -> &Arc<RwLock<Config>>;

    fn sentry(&self) -> &SentryService;

    fn db(&self) -> &DBService;

    fn insights(&self) -> &InsightsService;

    fn events(&self) -> &EventService;

    fn webhooks(&self) -> &WebhookDispatcher;

    fn transitions(&self) -> &TransitionService;

    /// Periodic retention sweep applying the default cleanup policy. Returns
    /// `None` when the sweep is disabled in config.
    async fn spawn_retention_sweep(&self) -> Option<JoinHandle<()>> {
        let settings = self.config().read().await.retention.clone();
        if !settings.sweep_enabled {
            tracing::info!("Retention sweep disabled");
            return None;
        }

        let transitions = self.transitions().clone();
        Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(settings.sweep_interval_secs.max(60)));
            interval.tick().await;
            loop {
                interval.tick().await;
                match transitions.cleanup(None, None).await {
                    Ok(outcome) if outcome.deleted_count > 0 => {
                        tracing::info!(
                            "Retention sweep removed {} terminal workflow state(s)",
                            outcome.deleted_count
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Retention sweep failed: {}", e);
                    }
                }
            }
        }))
    }

    /// Stop the hub's heartbeat/reaper tasks for clean process termination.
    fn stop_background_tasks(&self) {
        self.events().shutdown();
    }
}
