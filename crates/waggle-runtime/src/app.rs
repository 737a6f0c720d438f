//! Top-level application wiring. Every long-lived component is an explicit
//! field here, created in order at startup and torn down in reverse.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use waggle_agent::{AgentRunner, AgentService};
use waggle_bridge::BridgeClient;
use waggle_config::Settings;
use waggle_crypto::TokenCipher;
use waggle_queue::{ListStore, MessageQueue, QueueConfig, RedisListStore};
use waggle_store::Store;

use crate::delivery::ReplyDelivery;
use crate::monitor::Monitor;
use crate::orchestrator::{IntegrationOrchestrator, OrchestratorConfig};
use crate::processor::MessageProcessor;
use crate::supervisor::BridgeSupervisor;

pub struct App {
    pub settings: Settings,
    pub store: Store,
    pub queue: Arc<MessageQueue>,
    pub agent: Arc<dyn AgentRunner>,
    pub delivery: Arc<ReplyDelivery>,
    pub monitor: Arc<Monitor>,
    pub orchestrator: Arc<IntegrationOrchestrator>,
}

impl App {
    /// Connect to the configured backends and assemble the component graph.
    pub async fn new(settings: Settings) -> Result<Self> {
        let store = Store::open(database_path(&settings.database_url))?;
        let list_store: Arc<dyn ListStore> =
            Arc::new(RedisListStore::connect(&settings.redis_url).await?);
        Ok(Self::assemble(settings, store, list_store))
    }

    /// Wire the components against explicit backends. Used by `new` and by
    /// tests that substitute in-memory stores.
    pub fn assemble(settings: Settings, store: Store, list_store: Arc<dyn ListStore>) -> Self {
        let queue = Arc::new(MessageQueue::new(
            list_store,
            QueueConfig {
                prefix: settings.queue_prefix.clone(),
                max_retries: settings.queue_max_retries,
                retry_delay: Duration::from_secs(settings.queue_retry_delay_secs),
                ttl_secs: settings.queue_ttl_secs,
            },
        ));

        let bridge = BridgeClient::new(
            settings.bridge_url.clone(),
            Duration::from_secs(settings.bridge_timeout_secs),
            Some(settings.webhook_url()),
        );

        let cipher = TokenCipher::new(&settings.encryption_key);
        let agent: Arc<dyn AgentRunner> = Arc::new(AgentService::new(store.clone(), cipher));

        let delivery = Arc::new(ReplyDelivery::new(
            bridge.clone(),
            store.clone(),
            settings.system_number.clone(),
        ));
        let processor = Arc::new(
            MessageProcessor::new(queue.clone(), agent.clone()).with_delivery(delivery.clone()),
        );
        let supervisor = Arc::new(BridgeSupervisor::new(
            bridge,
            settings.webhook_url(),
            settings.system_number.clone(),
        ));
        let monitor = Arc::new(Monitor::new(
            store.clone(),
            queue.clone(),
            supervisor.clone(),
            Duration::from_secs(settings.monitor_interval_secs),
        ));
        let orchestrator = Arc::new(IntegrationOrchestrator::new(
            queue.clone(),
            processor,
            supervisor,
            monitor.clone(),
            OrchestratorConfig {
                worker_count: settings.worker_count,
            },
        ));

        Self {
            settings,
            store,
            queue,
            agent,
            delivery,
            monitor,
            orchestrator,
        }
    }

    /// Tear the integration down. The store handle closes when dropped.
    pub async fn close(&self) {
        self.orchestrator.shutdown().await;
    }
}

/// Accept both a bare path and a `sqlite://` DSN.
fn database_path(url: &str) -> &str {
    url.strip_prefix("sqlite://").unwrap_or(url)
}
