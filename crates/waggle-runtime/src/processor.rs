//! Worker loop consuming the priority queue: dequeue, run the turn,
//! acknowledge or hand back for retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use waggle_agent::AgentRunner;
use waggle_queue::{MessageQueue, QueuedMessage};

use crate::delivery::ReplyDelivery;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Pause when every lane is empty.
    pub idle_delay: Duration,
    /// Pause after a loop-level failure, to avoid a tight error spin.
    pub error_delay: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_secs(1),
            error_delay: Duration::from_secs(5),
        }
    }
}

pub struct MessageProcessor {
    queue: Arc<MessageQueue>,
    agent: Arc<dyn AgentRunner>,
    delivery: Option<Arc<ReplyDelivery>>,
    config: ProcessorConfig,
}

impl MessageProcessor {
    pub fn new(queue: Arc<MessageQueue>, agent: Arc<dyn AgentRunner>) -> Self {
        Self::with_config(queue, agent, ProcessorConfig::default())
    }

    pub fn with_config(
        queue: Arc<MessageQueue>,
        agent: Arc<dyn AgentRunner>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            agent,
            delivery: None,
            config,
        }
    }

    /// Send successful replies over the bridge before acknowledging.
    pub fn with_delivery(mut self, delivery: Arc<ReplyDelivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// One dequeue-and-process cycle. `Ok(false)` when the queue was empty.
    pub async fn process_single(&self) -> Result<bool> {
        match self.queue.dequeue().await? {
            Some(message) => {
                self.process(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, message: QueuedMessage) -> Result<()> {
        tracing::info!(
            "processing message {} for user {}",
            message.id,
            message.user_id
        );

        let outcome = match self.agent.run_turn(message.user_id, &message.content).await {
            Ok(reply) => match (&self.delivery, reply.success) {
                (Some(delivery), true) => delivery.deliver(message.user_id, &reply.content).await,
                _ => Ok(()),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.queue.acknowledge(&message.id).await?;
                tracing::info!("successfully processed message {}", message.id);
            }
            Err(e) => {
                tracing::error!("error processing message {}: {e}", message.id);
                let id = message.id.clone();
                if !self.queue.retry(message, &e.to_string()).await? {
                    tracing::error!("message {id} moved to failed queue");
                }
            }
        }
        Ok(())
    }

    /// Continuous worker loop, until cancelled. A cancelled in-flight
    /// record stays in the processing set for operator recovery.
    pub async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        tracing::info!("message processor worker {worker_id} started");
        loop {
            let step = async {
                match self.process_single().await {
                    Ok(true) => {}
                    Ok(false) => sleep(self.config.idle_delay).await,
                    Err(e) => {
                        tracing::error!("error in processor worker {worker_id}: {e}");
                        sleep(self.config.error_delay).await;
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = step => {}
            }
        }
        tracing::info!("message processor worker {worker_id} stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use waggle_queue::{MemoryListStore, MessagePriority, QueueConfig};
    use waggle_schema::AgentReply;

    /// Agent double that fails a configured number of times, then succeeds.
    struct FlakyAgent {
        calls: AtomicUsize,
        failures: usize,
    }

    impl FlakyAgent {
        fn failing(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
            }
        }
    }

    #[async_trait::async_trait]
    impl AgentRunner for FlakyAgent {
        async fn run_turn(&self, _user_id: i64, content: &str) -> Result<AgentReply> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                anyhow::bail!("transient agent failure");
            }
            Ok(AgentReply {
                content: format!("echo: {content}"),
                success: true,
                error_message: None,
                metadata: None,
            })
        }
    }

    fn queue(retry_delay: Duration) -> Arc<MessageQueue> {
        Arc::new(MessageQueue::new(
            Arc::new(MemoryListStore::new()),
            QueueConfig {
                retry_delay,
                ..QueueConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn successful_turn_is_acknowledged() {
        let queue = queue(Duration::from_secs(60));
        let agent = Arc::new(FlakyAgent::failing(0));
        let processor = MessageProcessor::new(queue.clone(), agent.clone());

        queue.enqueue(1, "hello", MessagePriority::Normal, None).await.unwrap();
        assert!(processor.process_single().await.unwrap());
        assert!(!processor.process_single().await.unwrap());

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_retries_with_backoff() {
        let queue = queue(Duration::from_secs(10));
        let agent = Arc::new(FlakyAgent::failing(2));
        let processor = MessageProcessor::new(queue.clone(), agent.clone());

        queue.enqueue(1, "flaky", MessagePriority::Normal, None).await.unwrap();

        // Attempt 1 fails, sleeps base inside retry.
        let before = tokio::time::Instant::now();
        assert!(processor.process_single().await.unwrap());
        assert_eq!(before.elapsed(), Duration::from_secs(10));

        // Attempt 2 fails, sleeps 2 * base.
        let before = tokio::time::Instant::now();
        assert!(processor.process_single().await.unwrap());
        assert_eq!(before.elapsed(), Duration::from_secs(20));

        // Attempt 3 succeeds and acknowledges.
        assert!(processor.process_single().await.unwrap());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter_the_record() {
        let queue = queue(Duration::from_millis(1));
        let agent = Arc::new(FlakyAgent::failing(usize::MAX));
        let processor = MessageProcessor::new(queue.clone(), agent);

        queue.enqueue(1, "doomed", MessagePriority::Normal, None).await.unwrap();
        while processor.process_single().await.unwrap() {}

        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn unsuccessful_reply_still_acknowledges() {
        // A turn that reports success=false (e.g. missing configuration) is
        // not an infrastructure failure and must not be retried.
        struct NoConfigAgent;

        #[async_trait::async_trait]
        impl AgentRunner for NoConfigAgent {
            async fn run_turn(&self, _user_id: i64, _content: &str) -> Result<AgentReply> {
                Ok(AgentReply {
                    content: "I apologize.".to_string(),
                    success: false,
                    error_message: Some("LLM configuration not found".to_string()),
                    metadata: None,
                })
            }
        }

        let queue = queue(Duration::from_secs(60));
        let processor = MessageProcessor::new(queue.clone(), Arc::new(NoConfigAgent));
        queue.enqueue(1, "hi", MessagePriority::Normal, None).await.unwrap();

        assert!(processor.process_single().await.unwrap());
        assert_eq!(queue.get_queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn successful_reply_is_delivered_before_acknowledge() {
        use waggle_bridge::BridgeClient;
        use waggle_store::Store;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/+5550000001/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message_id": "out_1",
                "timestamp": "2025-02-12T10:00:00Z",
                "status": "sent"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("+1234567890", None).await.unwrap();
        let delivery = Arc::new(crate::ReplyDelivery::new(
            BridgeClient::new(server.uri(), Duration::from_secs(2), None),
            store,
            "+5550000001".to_string(),
        ));

        let queue = queue(Duration::from_secs(60));
        let processor = MessageProcessor::new(queue.clone(), Arc::new(FlakyAgent::failing(0)))
            .with_delivery(delivery);

        queue.enqueue(user.id, "hi", MessagePriority::Normal, None).await.unwrap();
        assert!(processor.process_single().await.unwrap());
        assert_eq!(queue.get_queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_transport_failure_triggers_retry() {
        use waggle_bridge::BridgeClient;
        use waggle_store::Store;

        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("+1234567890", None).await.unwrap();
        let delivery = Arc::new(crate::ReplyDelivery::new(
            BridgeClient::new("http://127.0.0.1:9", Duration::from_secs(1), None),
            store,
            "+5550000001".to_string(),
        ));

        let queue = queue(Duration::from_millis(1));
        let processor = MessageProcessor::new(queue.clone(), Arc::new(FlakyAgent::failing(0)))
            .with_delivery(delivery);

        queue.enqueue(user.id, "hi", MessagePriority::Normal, None).await.unwrap();
        assert!(processor.process_single().await.unwrap());

        // The turn itself succeeded, but delivery failed: requeued on low.
        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.queues.low, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn worker_loop_stops_on_cancel() {
        let queue = queue(Duration::from_secs(60));
        let processor = Arc::new(MessageProcessor::with_config(
            queue.clone(),
            Arc::new(FlakyAgent::failing(0)),
            ProcessorConfig {
                idle_delay: Duration::from_millis(5),
                error_delay: Duration::from_millis(5),
            },
        ));

        let cancel = CancellationToken::new();
        let handle = {
            let processor = processor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { processor.run(0, cancel).await })
        };

        queue.enqueue(1, "work", MessagePriority::High, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(queue.get_queue_stats().await.unwrap().total, 0);
    }
}
