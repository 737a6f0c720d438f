//! Periodic health checks over the four infrastructure components:
//! database, queue store, bridge, and queue depth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use waggle_queue::MessageQueue;
use waggle_store::Store;

use crate::supervisor::BridgeSupervisor;

/// Queue depth limits beyond which the component is reported degraded.
const MAX_FAILED: usize = 100;
const MAX_QUEUED: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub name: String,
    pub healthy: bool,
    pub details: Value,
    pub checked_at: DateTime<Utc>,
}

impl ComponentStatus {
    fn new(name: &str, healthy: bool, details: Value) -> Self {
        Self {
            name: name.to_string(),
            healthy,
            details,
            checked_at: Utc::now(),
        }
    }
}

struct MonitorState {
    last_status: HashMap<String, ComponentStatus>,
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

pub struct Monitor {
    store: Store,
    queue: Arc<MessageQueue>,
    supervisor: Arc<BridgeSupervisor>,
    interval: Duration,
    state: Mutex<MonitorState>,
}

impl Monitor {
    pub fn new(
        store: Store,
        queue: Arc<MessageQueue>,
        supervisor: Arc<BridgeSupervisor>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            supervisor,
            interval,
            state: Mutex::new(MonitorState {
                last_status: HashMap::new(),
                task: None,
                cancel: None,
            }),
        }
    }

    /// Start the periodic check loop. A second start is a no-op.
    pub async fn start(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.task.is_some() {
            tracing::warn!("integration monitor is already running");
            return;
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::clone(&self);
        let token = cancel.clone();
        let interval = self.interval;
        state.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {
                        monitor.check_all().await;
                    }
                }
            }
        }));
        state.cancel = Some(cancel);
        tracing::info!("integration monitor started with {:?} interval", interval);
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
        tracing::info!("integration monitor stopped");
    }

    /// Check every component concurrently and remember the snapshot.
    pub async fn check_all(&self) -> HashMap<String, ComponentStatus> {
        let (database, queue_store, bridge, queue_depth) = tokio::join!(
            self.check_database(),
            self.check_queue_store(),
            self.check_bridge(),
            self.check_queue_depth(),
        );

        let mut results = HashMap::new();
        for status in [database, queue_store, bridge, queue_depth] {
            results.insert(status.name.clone(), status);
        }

        let healthy = results.values().filter(|s| s.healthy).count();
        let total = results.len();
        let overall = if healthy == total { "healthy" } else { "degraded" };
        tracing::info!(
            "integration health check: {overall} ({healthy}/{total} components healthy)"
        );

        let mut state = self.state.lock().await;
        state.last_status = results.clone();
        results
    }

    async fn check_database(&self) -> ComponentStatus {
        match self.store.health_snapshot().await {
            Ok((users, messages)) => ComponentStatus::new(
                "database",
                true,
                json!({
                    "users": users,
                    "messages": messages,
                    "connection": "established",
                }),
            ),
            Err(e) => ComponentStatus::new("database", false, json!({"error": e.to_string()})),
        }
    }

    async fn check_queue_store(&self) -> ComponentStatus {
        let ping = self.queue.ping().await;
        match ping {
            Ok(()) => {
                let info = self.queue.server_info().await.unwrap_or_else(|_| json!({}));
                ComponentStatus::new(
                    "queue_store",
                    true,
                    json!({"connection": "established", "info": info}),
                )
            }
            Err(e) => ComponentStatus::new("queue_store", false, json!({"error": e.to_string()})),
        }
    }

    async fn check_bridge(&self) -> ComponentStatus {
        let health = self.supervisor.check_health().await;
        let healthy = health["status"] == "healthy";
        ComponentStatus::new("whatsapp_bridge", healthy, health)
    }

    async fn check_queue_depth(&self) -> ComponentStatus {
        match self.queue.get_queue_stats().await {
            Ok(stats) => {
                let queued = stats.total - stats.failed;
                let healthy = stats.failed < MAX_FAILED && queued < MAX_QUEUED;
                ComponentStatus::new(
                    "message_queue",
                    healthy,
                    serde_json::to_value(&stats).unwrap_or_else(|_| json!({})),
                )
            }
            Err(e) => ComponentStatus::new("message_queue", false, json!({"error": e.to_string()})),
        }
    }

    /// Aggregate snapshot: healthy iff every component is healthy. Runs a
    /// fresh check when none has completed yet.
    pub async fn get_system_health(&self) -> Value {
        let snapshot = {
            let state = self.state.lock().await;
            state.last_status.clone()
        };
        let snapshot = if snapshot.is_empty() {
            self.check_all().await
        } else {
            snapshot
        };

        let unhealthy = snapshot.values().filter(|s| !s.healthy).count();
        let overall_healthy = unhealthy == 0;

        let components: serde_json::Map<String, Value> = snapshot
            .iter()
            .map(|(name, status)| {
                (
                    name.clone(),
                    json!({
                        "healthy": status.healthy,
                        "details": status.details.clone(),
                        "checked_at": status.checked_at.to_rfc3339(),
                    }),
                )
            })
            .collect();

        json!({
            "healthy": overall_healthy,
            "status": if overall_healthy { "healthy" } else { "degraded" },
            "components": components,
            "summary": {
                "total_components": snapshot.len(),
                "healthy_components": snapshot.len() - unhealthy,
                "unhealthy_components": unhealthy,
            },
            "checked_at": Utc::now().to_rfc3339(),
        })
    }
}
