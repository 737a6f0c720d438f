use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::store::ListStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    High,
    Normal,
    Low,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Dequeue visits lanes in this order, so high is never starved by lower
/// lanes for more than one cycle.
pub const DEFAULT_PRIORITIES: [MessagePriority; 3] = [
    MessagePriority::High,
    MessagePriority::Normal,
    MessagePriority::Low,
];

/// A queued agent turn, serialized as self-describing JSON in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub user_id: i64,
    pub content: String,
    pub priority: MessagePriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Key prefix, e.g. `waggle:queue:`.
    pub prefix: String,
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_delay: Duration,
    /// TTL refreshed on each queue key per enqueue.
    pub ttl_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "waggle:queue:".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneCounts {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queues: LaneCounts,
    pub processing: usize,
    pub failed: usize,
    pub total: usize,
}

/// Priority message queue: three FIFO lanes, a processing set and a failed
/// (dead-letter) set. Handoff is at-least-once: the atomic
/// pop-right-push-left makes a record visible to at most one consumer until
/// it is acknowledged or retried.
pub struct MessageQueue {
    store: Arc<dyn ListStore>,
    config: QueueConfig,
}

impl MessageQueue {
    pub fn new(store: Arc<dyn ListStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn queue_key(&self, priority: MessagePriority) -> String {
        format!("{}{}", self.config.prefix, priority.as_str())
    }

    fn processing_key(&self) -> String {
        format!("{}processing", self.config.prefix)
    }

    fn failed_key(&self) -> String {
        format!("{}failed", self.config.prefix)
    }

    /// Add a message to a priority lane and refresh the lane's TTL.
    pub async fn enqueue(
        &self,
        user_id: i64,
        content: impl Into<String>,
        priority: MessagePriority,
        metadata: Option<Value>,
    ) -> Result<QueuedMessage> {
        let message = QueuedMessage {
            id: format!("{user_id}:{}", Utc::now().timestamp_micros()),
            user_id,
            content: content.into(),
            priority,
            retry_count: 0,
            max_retries: self.config.max_retries,
            created_at: Utc::now(),
            last_attempt_at: None,
            error: None,
            metadata: metadata.unwrap_or_else(|| json!({})),
        };

        let key = self.queue_key(priority);
        self.store
            .push_left(&key, &serde_json::to_string(&message)?)
            .await?;
        self.store.expire(&key, self.config.ttl_secs).await?;

        tracing::info!("enqueued message {} with priority {:?}", message.id, priority);
        Ok(message)
    }

    /// Take the next message, visiting high before normal before low. The
    /// record moves atomically into the processing set, stamped with the
    /// attempt time. `None` when every lane is empty.
    pub async fn dequeue(&self) -> Result<Option<QueuedMessage>> {
        self.dequeue_priorities(&DEFAULT_PRIORITIES).await
    }

    pub async fn dequeue_priorities(
        &self,
        priorities: &[MessagePriority],
    ) -> Result<Option<QueuedMessage>> {
        let processing = self.processing_key();
        for &priority in priorities {
            let key = self.queue_key(priority);
            if let Some(raw) = self.store.pop_right_push_left(&key, &processing).await? {
                let mut message: QueuedMessage = serde_json::from_str(&raw)?;
                message.last_attempt_at = Some(Utc::now());

                // Rewrite the processing copy so it carries the new stamp.
                self.store.remove_first(&processing, &raw).await?;
                self.store
                    .push_left(&processing, &serde_json::to_string(&message)?)
                    .await?;

                tracing::info!("dequeued message {} from {:?} queue", message.id, priority);
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Remove a processed message from the processing set. `false` when no
    /// record with that id is present.
    pub async fn acknowledge(&self, message_id: &str) -> Result<bool> {
        let processing = self.processing_key();
        for raw in self.store.range(&processing).await? {
            let message: QueuedMessage = match serde_json::from_str(&raw) {
                Ok(message) => message,
                Err(_) => continue,
            };
            if message.id == message_id {
                self.store.remove_first(&processing, &raw).await?;
                tracing::info!("acknowledged message {message_id}");
                return Ok(true);
            }
        }
        tracing::warn!("message {message_id} not found in processing queue");
        Ok(false)
    }

    /// Record a failed attempt. Dead-letters the record and returns `false`
    /// once the retry ceiling is reached; otherwise sleeps the exponential
    /// backoff (`base * 2^(n-1)`) and requeues on the low lane.
    pub async fn retry(&self, mut message: QueuedMessage, error: &str) -> Result<bool> {
        message.retry_count += 1;
        message.error = Some(error.to_string());
        message.last_attempt_at = Some(Utc::now());

        let processing = self.processing_key();
        for raw in self.store.range(&processing).await? {
            let parsed: QueuedMessage = match serde_json::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            if parsed.id == message.id {
                self.store.remove_first(&processing, &raw).await?;
                break;
            }
        }

        if message.retry_count >= message.max_retries {
            self.store
                .push_left(&self.failed_key(), &serde_json::to_string(&message)?)
                .await?;
            tracing::error!(
                "message {} exceeded max retries, moved to failed queue",
                message.id
            );
            return Ok(false);
        }

        let delay = self.config.retry_delay * 2u32.pow(message.retry_count - 1);
        sleep(delay).await;

        self.store
            .push_left(
                &self.queue_key(MessagePriority::Low),
                &serde_json::to_string(&message)?,
            )
            .await?;
        tracing::info!("retrying message {} (attempt {})", message.id, message.retry_count);
        Ok(true)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let high = self.store.len(&self.queue_key(MessagePriority::High)).await?;
        let normal = self.store.len(&self.queue_key(MessagePriority::Normal)).await?;
        let low = self.store.len(&self.queue_key(MessagePriority::Low)).await?;
        let processing = self.store.len(&self.processing_key()).await?;
        let failed = self.store.len(&self.failed_key()).await?;

        Ok(QueueStats {
            queues: LaneCounts { high, normal, low },
            processing,
            failed,
            total: high + normal + low + processing + failed,
        })
    }

    /// Drop the dead-letter list, returning how many records it held.
    pub async fn clear_failed(&self) -> Result<usize> {
        let key = self.failed_key();
        let count = self.store.len(&key).await?;
        self.store.delete(&key).await?;
        tracing::info!("cleared {count} failed messages");
        Ok(count)
    }

    /// Move every dead-lettered record back onto the normal lane with its
    /// retry accounting reset. Returns how many were requeued.
    pub async fn requeue_failed(&self) -> Result<usize> {
        let key = self.failed_key();
        let normal = self.queue_key(MessagePriority::Normal);
        let mut count = 0;

        for raw in self.store.range(&key).await? {
            let mut message: QueuedMessage = match serde_json::from_str(&raw) {
                Ok(message) => message,
                Err(_) => continue,
            };
            message.retry_count = 0;
            message.error = None;
            self.store
                .push_left(&normal, &serde_json::to_string(&message)?)
                .await?;
            count += 1;
        }

        self.store.delete(&key).await?;
        tracing::info!("requeued {count} failed messages");
        Ok(count)
    }

    /// Liveness probe against the backing store.
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Backend diagnostics for the health monitor.
    pub async fn server_info(&self) -> Result<Value> {
        self.store.server_info().await
    }

    /// Release the store connection.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryListStore;

    fn queue_with(retry_delay: Duration) -> (Arc<MemoryListStore>, MessageQueue) {
        let store = Arc::new(MemoryListStore::new());
        let queue = MessageQueue::new(
            store.clone(),
            QueueConfig {
                retry_delay,
                ..QueueConfig::default()
            },
        );
        (store, queue)
    }

    #[tokio::test]
    async fn fifo_within_a_single_lane() {
        let (_, queue) = queue_with(Duration::from_secs(60));
        for i in 0..3 {
            queue
                .enqueue(1, format!("m{i}"), MessagePriority::Normal, None)
                .await
                .unwrap();
        }

        for i in 0..3 {
            let message = queue.dequeue().await.unwrap().unwrap();
            assert_eq!(message.content, format!("m{i}"));
        }
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn high_priority_drained_before_low() {
        let (_, queue) = queue_with(Duration::from_secs(60));
        queue.enqueue(1, "h1", MessagePriority::High, None).await.unwrap();
        queue.enqueue(1, "l1", MessagePriority::Low, None).await.unwrap();
        queue.enqueue(1, "h2", MessagePriority::High, None).await.unwrap();

        let order: Vec<String> = [
            queue.dequeue().await.unwrap().unwrap().content,
            queue.dequeue().await.unwrap().unwrap().content,
            queue.dequeue().await.unwrap().unwrap().content,
        ]
        .into();
        assert_eq!(order, vec!["h1", "h2", "l1"]);
    }

    #[tokio::test]
    async fn dequeued_record_stays_in_processing_until_acknowledged() {
        let (_, queue) = queue_with(Duration::from_secs(60));
        queue.enqueue(7, "work", MessagePriority::Normal, None).await.unwrap();

        let message = queue.dequeue().await.unwrap().unwrap();
        assert!(message.last_attempt_at.is_some());

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.queues.normal, 0);

        assert!(queue.acknowledge(&message.id).await.unwrap());
        assert!(!queue.acknowledge(&message.id).await.unwrap());
        assert_eq!(queue.get_queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn enqueue_refreshes_lane_ttl() {
        let (store, queue) = queue_with(Duration::from_secs(60));
        queue.enqueue(1, "m", MessagePriority::High, None).await.unwrap();
        assert_eq!(store.ttl("waggle:queue:high"), Some(86_400));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backoff_doubles_per_attempt() {
        let (_, queue) = queue_with(Duration::from_secs(10));
        queue.enqueue(1, "flaky", MessagePriority::Normal, None).await.unwrap();

        // First failure: backoff = base.
        let message = queue.dequeue().await.unwrap().unwrap();
        let before = tokio::time::Instant::now();
        assert!(queue.retry(message, "boom").await.unwrap());
        assert_eq!(before.elapsed(), Duration::from_secs(10));

        // Second failure: backoff = 2 * base.
        let message = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(message.retry_count, 1);
        assert_eq!(message.priority, MessagePriority::Normal);
        let before = tokio::time::Instant::now();
        assert!(queue.retry(message, "boom again").await.unwrap());
        assert_eq!(before.elapsed(), Duration::from_secs(20));

        // Third failure reaches max_retries: dead-letter, no sleep.
        let message = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(message.retry_count, 2);
        assert!(!queue.retry(message, "gave up").await.unwrap());

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.queues, LaneCounts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn retried_record_lands_on_low_lane_with_error() {
        let (_, queue) = queue_with(Duration::from_millis(1));
        queue.enqueue(1, "job", MessagePriority::High, None).await.unwrap();

        let message = queue.dequeue().await.unwrap().unwrap();
        queue.retry(message, "transient").await.unwrap();

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.queues.low, 1);

        let retried = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.error.as_deref(), Some("transient"));
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_failed_resets_retry_accounting() {
        let (_, queue) = queue_with(Duration::from_millis(1));
        queue.enqueue(1, "doomed", MessagePriority::Normal, None).await.unwrap();

        // Exhaust retries.
        loop {
            let message = queue.dequeue().await.unwrap().unwrap();
            if !queue.retry(message, "always fails").await.unwrap() {
                break;
            }
        }
        assert_eq!(queue.get_queue_stats().await.unwrap().failed, 1);

        assert_eq!(queue.requeue_failed().await.unwrap(), 1);
        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.queues.normal, 1);

        let revived = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(revived.retry_count, 0);
        assert!(revived.error.is_none());
    }

    #[tokio::test]
    async fn clear_failed_reports_prior_length() {
        let (_, queue) = queue_with(Duration::from_millis(1));
        assert_eq!(queue.clear_failed().await.unwrap(), 0);

        queue.enqueue(1, "a", MessagePriority::Normal, None).await.unwrap();
        let message = queue.dequeue().await.unwrap().unwrap();
        // Force straight to the dead-letter list.
        let mut message = message;
        message.retry_count = message.max_retries - 1;
        assert!(!queue.retry(message, "x").await.unwrap());

        assert_eq!(queue.clear_failed().await.unwrap(), 1);
        assert_eq!(queue.get_queue_stats().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn queued_message_json_is_self_describing() {
        let (_, queue) = queue_with(Duration::from_secs(60));
        let message = queue
            .enqueue(42, "hello", MessagePriority::Normal, Some(json!({"source": "webhook"})))
            .await
            .unwrap();

        let raw = serde_json::to_string(&message).unwrap();
        let parsed: QueuedMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, message);
        assert!(parsed.id.starts_with("42:"));
        assert_eq!(parsed.metadata["source"], "webhook");
    }
}
