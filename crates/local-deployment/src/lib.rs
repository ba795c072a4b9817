use std::sync::Arc;

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use services::services::{
    config::{Config, load_config_from_file, save_config_to_file},
    events::EventService,
    insights::InsightsService,
    sentry::SentryService,
    transitions::TransitionService,
    webhooks::WebhookDispatcher,
};
use tokio::sync::RwLock;
use utils::assets::config_path;

/// Single-process deployment: SQLite store, in-process hub and dispatcher.
#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<RwLock<Config>>,
    sentry: SentryService,
    db: DBService,
    insights: InsightsService,
    events: EventService,
    webhooks: WebhookDispatcher,
    transitions: TransitionService,
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let raw_config = load_config_from_file(&config_path()).await;
        // Persist defaults and any migrated fields so the file stays current.
        save_config_to_file(&raw_config, &config_path()).await?;

        let sentry = SentryService::new();
        let db = DBService::new().await?;
        let insights = InsightsService::new();

        let events = EventService::new(insights.clone(), raw_config.stream.clone());
        events.spawn_maintenance();

        let webhooks = WebhookDispatcher::new(db.pool.clone(), raw_config.dispatch.clone());
        let transitions = TransitionService::new(
            db.pool.clone(),
            events.clone(),
            webhooks.clone(),
            raw_config.retention.clone(),
        );

        let config = Arc::new(RwLock::new(raw_config));

        Ok(Self {
            config,
            sentry,
            db,
            insights,
            events,
            webhooks,
            transitions,
        })
    }

    fn config(&self) -> &Arc<RwLock<Config>> {
        &self.config
    }

    fn sentry(&self) -> &SentryService {
        &self.sentry
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn insights(&self) -> &InsightsService {
        &self.insights
    }

    fn events(&self) -> &EventService {
        &self.events
    }

    fn webhooks(&self) -> &WebhookDispatcher {
        &self.webhooks
    }

    fn transitions(&self) -> &TransitionService {
        &self.transitions
    }
}
