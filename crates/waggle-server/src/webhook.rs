//! Webhook event processing: classify bridge events, persist messages,
//! and dispatch system-bound text to the agent.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use waggle_agent::AgentRunner;
use waggle_runtime::ReplyDelivery;
use waggle_schema::{
    strip_jid, ConnectionStatusData, MessageCreate, MessageDirection, MessageFailedData,
    MessageReceivedData, MessageSentData, MessageType, WebhookEvent, WebhookEventType,
};
use waggle_store::Store;

use crate::retry::with_retry;

/// In-handler dispatch retry policy.
const DISPATCH_MAX_RETRIES: u32 = 3;
const DISPATCH_BASE_DELAY: Duration = Duration::from_secs(1);
const DISPATCH_BACKOFF: f64 = 2.0;

pub struct WebhookHandler {
    store: Store,
    agent: Arc<dyn AgentRunner>,
    delivery: Option<Arc<ReplyDelivery>>,
    system_number: String,
}

impl WebhookHandler {
    pub fn new(store: Store, agent: Arc<dyn AgentRunner>, system_number: String) -> Self {
        Self {
            store,
            agent,
            delivery: None,
            system_number,
        }
    }

    /// Send successful replies back over the bridge.
    pub fn with_delivery(mut self, delivery: Arc<ReplyDelivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Process one bridge event. Downstream failures surface in the result
    /// body, never as an error: webhook delivery must not be rejected.
    pub async fn handle(&self, event: WebhookEvent) -> Value {
        tracing::info!("processing webhook event: {:?}", event.event_type);
        match event.event_type {
            WebhookEventType::MessageReceived => self.handle_message_received(event.data).await,
            WebhookEventType::MessageSent => self.handle_message_sent(event.data).await,
            WebhookEventType::MessageFailed => self.handle_message_failed(event.data).await,
            WebhookEventType::ConnectionStatus => self.handle_connection_status(event.data).await,
            WebhookEventType::Unknown => {
                tracing::warn!("unknown webhook event type");
                json!({"status": "ignored", "reason": "unknown_event_type"})
            }
        }
    }

    async fn handle_message_received(&self, data: Value) -> Value {
        let data: MessageReceivedData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => return error_result(e),
        };

        let from_phone = strip_jid(&data.from_number).to_string();
        let to_phone = strip_jid(&data.to_number).to_string();

        // A message TO the system number is a turn the agent answers; a
        // message to a user's own number is archived on their behalf.
        let is_system_message = to_phone == self.system_number;
        let user_phone = if is_system_message {
            from_phone.clone()
        } else {
            to_phone.clone()
        };

        let display_name = format!("User {}", last_digits(&user_phone, 4));
        let user = match self
            .store
            .get_or_create_user(&user_phone, Some(display_name))
            .await
        {
            Ok(user) => user,
            Err(e) => return error_result(e),
        };

        let message_type = if data.media_url.is_some() {
            MessageType::from_media_type(data.media_type.as_deref())
        } else {
            MessageType::Text
        };

        let direction = if is_system_message {
            MessageDirection::Incoming
        } else if from_phone == user_phone {
            MessageDirection::Outgoing
        } else {
            MessageDirection::Incoming
        };

        let mut metadata = json!({
            "whatsapp_message_id": data.message_id.clone(),
            "timestamp": data.timestamp.to_rfc3339(),
            "is_system_message": is_system_message,
        });
        if let Some(media_url) = &data.media_url {
            metadata["media_url"] = json!(media_url);
            metadata["media_type"] = json!(data.media_type);
        }

        let create = MessageCreate {
            content: data.text.clone(),
            direction,
            message_type,
            caption: None,
            whatsapp_message_id: Some(data.message_id.clone()),
            metadata: Some(metadata),
            sender_jid: Some(data.from_number.clone()),
            recipient_jid: Some(data.to_number.clone()),
            reply_to_id: None,
        };

        let message = match self.store.store_message(user.id, create).await {
            Ok(message) => message,
            Err(e) => return error_result(e),
        };

        // Agent dispatch only for non-empty text addressed to the system.
        let text = data.text.as_deref().unwrap_or("");
        if !(is_system_message && !text.is_empty()) {
            tracing::info!("stored message {} without dispatch", message.id);
            return json!({"status": "stored", "message_id": message.id});
        }

        let dispatch = with_retry(
            || {
                let agent = self.agent.clone();
                let text = text.to_string();
                let user_id = user.id;
                async move { agent.run_turn(user_id, &text).await }
            },
            DISPATCH_MAX_RETRIES,
            DISPATCH_BASE_DELAY,
            DISPATCH_BACKOFF,
        )
        .await;

        match dispatch {
            Ok(reply) => {
                if reply.success {
                    if let Some(delivery) = &self.delivery {
                        if let Err(e) = delivery.deliver(user.id, &reply.content).await {
                            tracing::error!("failed to deliver reply to {}: {e}", user.phone_number);
                        }
                    }
                }
                json!({"status": "processed", "message_id": message.id})
            }
            Err(e) => {
                tracing::error!("agent processing failed after retries: {e}");
                json!({
                    "status": "stored",
                    "message_id": message.id,
                    "processing": "failed",
                })
            }
        }
    }

    async fn handle_message_sent(&self, data: Value) -> Value {
        let data: MessageSentData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => return error_result(e),
        };

        match self
            .store
            .update_message_status(&data.message_id, &data.status)
            .await
        {
            Ok(Some(_)) => {
                tracing::info!("updated message status: {} -> {}", data.message_id, data.status);
                json!({"status": "updated", "message_id": data.message_id})
            }
            Ok(None) => {
                tracing::warn!("message not found for update: {}", data.message_id);
                json!({"status": "not_found", "message_id": data.message_id})
            }
            Err(e) => error_result(e),
        }
    }

    async fn handle_message_failed(&self, data: Value) -> Value {
        let data: MessageFailedData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => return error_result(e),
        };

        let status = format!("failed: {}", data.error);
        match self
            .store
            .update_message_status(&data.message_id, &status)
            .await
        {
            Ok(Some(_)) => {
                tracing::error!("message delivery failed: {} - {}", data.message_id, data.error);
                json!({
                    "status": "updated",
                    "message_id": data.message_id,
                    "error": data.error,
                })
            }
            Ok(None) => {
                tracing::warn!("failed message not found: {}", data.message_id);
                json!({"status": "not_found", "message_id": data.message_id})
            }
            Err(e) => error_result(e),
        }
    }

    async fn handle_connection_status(&self, data: Value) -> Value {
        let data: ConnectionStatusData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => return error_result(e),
        };

        tracing::info!(
            "WhatsApp connection status: {} (session: {})",
            data.status,
            data.session_id
        );
        json!({
            "status": "acknowledged",
            "connection_status": data.status,
            "session_id": data.session_id,
        })
    }
}

fn last_digits(phone: &str, n: usize) -> &str {
    let start = phone.len().saturating_sub(n);
    phone.get(start..).unwrap_or(phone)
}

fn error_result(e: impl std::fmt::Display) -> Value {
    tracing::error!("error handling webhook event: {e}");
    json!({"status": "error", "message": e.to_string()})
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use waggle_schema::AgentReply;

    const SYSTEM: &str = "+5550000001";

    struct RecordingAgent {
        calls: AtomicUsize,
        failures: usize,
    }

    impl RecordingAgent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures: 0,
            })
        }

        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
            })
        }
    }

    #[async_trait::async_trait]
    impl AgentRunner for RecordingAgent {
        async fn run_turn(&self, _user_id: i64, content: &str) -> Result<AgentReply> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                anyhow::bail!("agent unavailable");
            }
            Ok(AgentReply {
                content: format!("re: {content}"),
                success: true,
                error_message: None,
                metadata: None,
            })
        }
    }

    fn received_event(data: Value) -> WebhookEvent {
        WebhookEvent {
            event_type: WebhookEventType::MessageReceived,
            timestamp: Utc::now(),
            data,
        }
    }

    async fn handler_with(agent: Arc<RecordingAgent>) -> (WebhookHandler, Store) {
        let store = Store::open_in_memory().unwrap();
        let handler = WebhookHandler::new(store.clone(), agent, SYSTEM.to_string());
        (handler, store)
    }

    #[tokio::test]
    async fn new_user_text_message_is_processed() {
        let agent = RecordingAgent::new();
        let (handler, store) = handler_with(agent.clone()).await;

        let result = handler
            .handle(received_event(json!({
                "from_number": "+1234567890@s.whatsapp.net",
                "to_number": "+5550000001@s.whatsapp.net",
                "message_id": "msg_123",
                "text": "Hello, can you help me?",
                "timestamp": "2025-02-12T10:00:00Z"
            })))
            .await;

        assert_eq!(result["status"], "processed");
        assert!(result["message_id"].is_number());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        let user = store.user_by_phone("+1234567890").await.unwrap().unwrap();
        assert_eq!(user.display_name.as_deref(), Some("User 7890"));
        assert!(user.is_active);

        let recent = store.get_recent_messages(user.id, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        let message = &recent[0];
        assert_eq!(message.direction("+1234567890"), MessageDirection::Incoming);
        assert_eq!(message.content.as_deref(), Some("Hello, can you help me?"));
        assert_eq!(message.whatsapp_message_id(), Some("msg_123"));
    }

    #[tokio::test]
    async fn media_message_stored_without_dispatch() {
        let agent = RecordingAgent::new();
        let (handler, store) = handler_with(agent.clone()).await;

        let result = handler
            .handle(received_event(json!({
                "from_number": "+1234567890@s.whatsapp.net",
                "to_number": "+5550000001@s.whatsapp.net",
                "message_id": "msg_media",
                "text": null,
                "media_url": "https://ex/img.jpg",
                "media_type": "image",
                "timestamp": "2025-02-12T10:00:00Z"
            })))
            .await;

        assert_eq!(result["status"], "stored");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);

        let user = store.user_by_phone("+1234567890").await.unwrap().unwrap();
        let recent = store.get_recent_messages(user.id, 10).await.unwrap();
        let message = &recent[0];
        assert_eq!(message.message_type, MessageType::Image);
        assert_eq!(message.content, None);
        let metadata = message.media_metadata.as_ref().unwrap();
        assert_eq!(metadata["media_url"], "https://ex/img.jpg");
        assert_eq!(metadata["is_system_message"], true);
    }

    #[tokio::test]
    async fn message_to_own_number_is_not_dispatched() {
        let agent = RecordingAgent::new();
        let (handler, store) = handler_with(agent.clone()).await;

        // Someone writes to the user's own linked number.
        let result = handler
            .handle(received_event(json!({
                "from_number": "+1999999999@s.whatsapp.net",
                "to_number": "+1234567890@s.whatsapp.net",
                "message_id": "msg_user",
                "text": "hi there",
                "timestamp": "2025-02-12T10:00:00Z"
            })))
            .await;

        assert_eq!(result["status"], "stored");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);

        // The owning user is the recipient.
        let user = store.user_by_phone("+1234567890").await.unwrap().unwrap();
        let recent = store.get_recent_messages(user.id, 10).await.unwrap();
        assert_eq!(recent[0].direction("+1234567890"), MessageDirection::Incoming);
    }

    #[tokio::test]
    async fn own_outgoing_message_derives_outgoing_direction() {
        let agent = RecordingAgent::new();
        let (handler, store) = handler_with(agent).await;

        // The user writes from their own number to someone else.
        handler
            .handle(received_event(json!({
                "from_number": "+1234567890@s.whatsapp.net",
                "to_number": "+1234567890@s.whatsapp.net",
                "message_id": "msg_self",
                "text": "note to self",
                "timestamp": "2025-02-12T10:00:00Z"
            })))
            .await;

        let user = store.user_by_phone("+1234567890").await.unwrap().unwrap();
        let recent = store.get_recent_messages(user.id, 10).await.unwrap();
        assert_eq!(recent[0].direction("+1234567890"), MessageDirection::Incoming);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_retries_then_reports_stored() {
        let agent = RecordingAgent::failing(usize::MAX);
        let (handler, _store) = handler_with(agent.clone()).await;

        let result = handler
            .handle(received_event(json!({
                "from_number": "+1234567890@s.whatsapp.net",
                "to_number": "+5550000001@s.whatsapp.net",
                "message_id": "msg_retry",
                "text": "please answer",
                "timestamp": "2025-02-12T10:00:00Z"
            })))
            .await;

        // Three attempts, then the message stays stored.
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result["status"], "stored");
        assert_eq!(result["processing"], "failed");
    }

    #[tokio::test]
    async fn sent_event_updates_delivery_status() {
        let agent = RecordingAgent::new();
        let (handler, store) = handler_with(agent).await;

        let user = store.get_or_create_user("+1234567890", None).await.unwrap();
        store
            .store_message(
                user.id,
                MessageCreate::text(MessageDirection::Outgoing, "sent text")
                    .with_whatsapp_message_id("msg_sent_123"),
            )
            .await
            .unwrap();

        let result = handler
            .handle(WebhookEvent {
                event_type: WebhookEventType::MessageSent,
                timestamp: Utc::now(),
                data: json!({
                    "message_id": "msg_sent_123",
                    "status": "delivered",
                    "to_number": "+1234567890",
                    "timestamp": "2025-02-12T10:00:00Z"
                }),
            })
            .await;

        assert_eq!(result["status"], "updated");
        let recent = store.get_recent_messages(user.id, 1).await.unwrap();
        assert_eq!(recent[0].delivery_status(), Some("delivered"));
    }

    #[tokio::test]
    async fn sent_event_for_unknown_message_reports_not_found() {
        let agent = RecordingAgent::new();
        let (handler, _store) = handler_with(agent).await;

        let result = handler
            .handle(WebhookEvent {
                event_type: WebhookEventType::MessageSent,
                timestamp: Utc::now(),
                data: json!({
                    "message_id": "ghost",
                    "to_number": "+1",
                    "timestamp": "2025-02-12T10:00:00Z"
                }),
            })
            .await;
        assert_eq!(result["status"], "not_found");
    }

    #[tokio::test]
    async fn failed_event_prefixes_status() {
        let agent = RecordingAgent::new();
        let (handler, store) = handler_with(agent).await;

        let user = store.get_or_create_user("+1234567890", None).await.unwrap();
        store
            .store_message(
                user.id,
                MessageCreate::text(MessageDirection::Outgoing, "out")
                    .with_whatsapp_message_id("msg_fail"),
            )
            .await
            .unwrap();

        let result = handler
            .handle(WebhookEvent {
                event_type: WebhookEventType::MessageFailed,
                timestamp: Utc::now(),
                data: json!({
                    "message_id": "msg_fail",
                    "error": "recipient unavailable",
                    "to_number": "+1234567890",
                    "timestamp": "2025-02-12T10:00:00Z"
                }),
            })
            .await;

        assert_eq!(result["status"], "updated");
        let recent = store.get_recent_messages(user.id, 1).await.unwrap();
        assert_eq!(
            recent[0].delivery_status(),
            Some("failed: recipient unavailable")
        );
    }

    #[tokio::test]
    async fn connection_status_is_acknowledged() {
        let agent = RecordingAgent::new();
        let (handler, _store) = handler_with(agent).await;

        let result = handler
            .handle(WebhookEvent {
                event_type: WebhookEventType::ConnectionStatus,
                timestamp: Utc::now(),
                data: json!({
                    "status": "connected",
                    "session_id": "+5550000001",
                    "timestamp": "2025-02-12T10:00:00Z"
                }),
            })
            .await;

        assert_eq!(result["status"], "acknowledged");
        assert_eq!(result["connection_status"], "connected");
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored() {
        let agent = RecordingAgent::new();
        let (handler, _store) = handler_with(agent).await;

        let result = handler
            .handle(WebhookEvent {
                event_type: WebhookEventType::Unknown,
                timestamp: Utc::now(),
                data: json!({}),
            })
            .await;
        assert_eq!(result["status"], "ignored");
        assert_eq!(result["reason"], "unknown_event_type");
    }

    #[tokio::test]
    async fn malformed_received_data_reports_error() {
        let agent = RecordingAgent::new();
        let (handler, _store) = handler_with(agent).await;

        let result = handler.handle(received_event(json!({"nope": true}))).await;
        assert_eq!(result["status"], "error");
        assert!(result["message"].is_string());
    }
}
