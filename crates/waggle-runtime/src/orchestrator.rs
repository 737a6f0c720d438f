//! Lifecycle of the integration: bridge setup, system session, worker
//! pool, and the health monitor.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use waggle_queue::MessageQueue;

use crate::monitor::Monitor;
use crate::processor::MessageProcessor;
use crate::supervisor::BridgeSupervisor;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker_count: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { worker_count: 3 }
    }
}

struct OrchestratorState {
    initialized: bool,
    workers: Vec<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

pub struct IntegrationOrchestrator {
    queue: Arc<MessageQueue>,
    processor: Arc<MessageProcessor>,
    supervisor: Arc<BridgeSupervisor>,
    monitor: Arc<Monitor>,
    config: OrchestratorConfig,
    state: Mutex<OrchestratorState>,
}

impl IntegrationOrchestrator {
    pub fn new(
        queue: Arc<MessageQueue>,
        processor: Arc<MessageProcessor>,
        supervisor: Arc<BridgeSupervisor>,
        monitor: Arc<Monitor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            supervisor,
            monitor,
            config,
            state: Mutex::new(OrchestratorState {
                initialized: false,
                workers: Vec::new(),
                cancel: None,
            }),
        }
    }

    /// Bring every component up, in order. Calling it twice reports
    /// `already_initialized` without spawning anything.
    pub async fn initialize(&self) -> Value {
        let mut state = self.state.lock().await;
        if state.initialized {
            tracing::warn!("integration already initialized");
            return json!({"status": "already_initialized"});
        }

        tracing::info!("initializing WhatsApp integration");
        let mut results = serde_json::Map::new();

        results.insert("bridge_config".to_string(), self.supervisor.setup().await);
        results.insert(
            "system_session".to_string(),
            self.supervisor.ensure_system_session().await,
        );

        let cancel = CancellationToken::new();
        tracing::info!("starting {} message processor workers", self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            let processor = Arc::clone(&self.processor);
            let token = cancel.child_token();
            state
                .workers
                .push(tokio::spawn(async move { processor.run(worker_id, token).await }));
        }
        results.insert(
            "message_processors".to_string(),
            json!({"started": self.config.worker_count}),
        );
        state.cancel = Some(cancel);

        Arc::clone(&self.monitor).start().await;
        results.insert("monitor".to_string(), json!({"status": "started"}));

        let health = self.monitor.check_all().await;
        let healthy = health.values().filter(|s| s.healthy).count();
        results.insert(
            "health_check".to_string(),
            json!({
                "healthy": healthy == health.len(),
                "components": health
                    .iter()
                    .map(|(name, status)| {
                        (
                            name.clone(),
                            json!({"healthy": status.healthy, "details": status.details.clone()}),
                        )
                    })
                    .collect::<serde_json::Map<String, Value>>(),
            }),
        );

        state.initialized = true;
        tracing::info!("WhatsApp integration initialized");
        json!({"status": "initialized", "results": results})
    }

    /// Tear everything down in reverse order: monitor, workers, queue
    /// connection.
    pub async fn shutdown(&self) -> Value {
        let mut state = self.state.lock().await;
        if !state.initialized {
            return json!({"status": "not_initialized"});
        }

        tracing::info!("shutting down WhatsApp integration");
        self.monitor.stop().await;

        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        for worker in state.workers.drain(..) {
            let _ = worker.await;
        }

        if let Err(e) = self.queue.close().await {
            tracing::warn!("failed to close queue store connection: {e}");
        }

        state.initialized = false;
        tracing::info!("WhatsApp integration shutdown complete");
        json!({"status": "shutdown_complete"})
    }

    /// Shutdown followed by a fresh initialize.
    pub async fn reinitialize(&self) -> Value {
        tracing::info!("reinitializing WhatsApp integration");
        let shutdown = self.shutdown().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let initialize = self.initialize().await;
        json!({"shutdown": shutdown, "initialize": initialize})
    }

    /// Current status: init flag, worker counts, and (when initialized)
    /// health, queue and bridge snapshots.
    pub async fn get_status(&self) -> Value {
        let (initialized, configured, running) = {
            let state = self.state.lock().await;
            (
                state.initialized,
                self.config.worker_count,
                state.workers.iter().filter(|w| !w.is_finished()).count(),
            )
        };

        let mut status = json!({
            "initialized": initialized,
            "workers": {"configured": configured, "running": running},
        });

        if initialized {
            status["health"] = self.monitor.get_system_health().await;
            status["queue"] = match self.queue.get_queue_stats().await {
                Ok(stats) => serde_json::to_value(&stats).unwrap_or(Value::Null),
                Err(e) => json!({"error": e.to_string()}),
            };
            status["bridge"] = self.supervisor.check_health().await;
        }

        status
    }
}
