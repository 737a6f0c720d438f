use std::sync::Arc;

use waggle_agent::AgentRunner;
use waggle_config::Settings;
use waggle_queue::MessageQueue;
use waggle_runtime::{App, IntegrationOrchestrator, ReplyDelivery};
use waggle_store::Store;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub queue: Arc<MessageQueue>,
    pub orchestrator: Arc<IntegrationOrchestrator>,
    pub agent: Arc<dyn AgentRunner>,
    pub delivery: Option<Arc<ReplyDelivery>>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn from_app(app: &App) -> Self {
        Self {
            store: app.store.clone(),
            queue: app.queue.clone(),
            orchestrator: app.orchestrator.clone(),
            agent: app.agent.clone(),
            delivery: Some(app.delivery.clone()),
            settings: Arc::new(app.settings.clone()),
        }
    }
}
