//! Bridge configuration: webhook registration and the system session that
//! receives user messages.

use serde_json::{json, Value};

use waggle_bridge::{BridgeClient, BridgeError};
use waggle_schema::SessionStatus;

/// Events the bridge is asked to deliver to the webhook endpoint.
pub const WEBHOOK_EVENTS: [&str; 4] = [
    "message.received",
    "message.sent",
    "message.failed",
    "connection.status",
];

pub struct BridgeSupervisor {
    client: BridgeClient,
    webhook_url: String,
    system_number: String,
}

impl BridgeSupervisor {
    pub fn new(client: BridgeClient, webhook_url: String, system_number: String) -> Self {
        Self {
            client,
            webhook_url,
            system_number,
        }
    }

    pub fn system_number(&self) -> &str {
        &self.system_number
    }

    /// Hand the bridge its webhook configuration. The bridge applies the
    /// webhook URL per session at creation time; this reports the intended
    /// subscription so operators can see it.
    pub async fn setup(&self) -> Value {
        match self.client.health_check().await {
            Ok(_) => {
                tracing::info!("WhatsApp bridge configured with webhook: {}", self.webhook_url);
                json!({
                    "status": "configured",
                    "webhook_url": self.webhook_url.clone(),
                    "configuration": {
                        "events": WEBHOOK_EVENTS,
                        "retry_config": {"max_retries": 3, "retry_delay": 5},
                    },
                })
            }
            Err(e) => {
                tracing::error!("failed to configure WhatsApp bridge: {e}");
                json!({"status": "error", "error": e.to_string()})
            }
        }
    }

    /// Make sure the system WhatsApp session exists and is connected.
    /// Reports `connected`, `disconnected` (QR attached) or `created`.
    pub async fn ensure_system_session(&self) -> Value {
        let session_id = self.system_number.clone();

        let sessions = match self.client.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!("failed to list bridge sessions: {e}");
                return json!({"status": "error", "error": e.to_string()});
            }
        };

        let existing = sessions.iter().find(|s| s.session_id == session_id);
        match existing {
            None => {
                if let Err(e) = self.client.create_session(&session_id).await {
                    tracing::error!("failed to create system session: {e}");
                    return json!({"status": "error", "error": e.to_string()});
                }
                tracing::info!("created system session: {session_id}");
                let qr = self.fetch_qr(&session_id).await;
                json!({
                    "status": "created",
                    "session_id": session_id,
                    "qr_code": qr,
                    "message": "Scan QR code to connect system WhatsApp",
                })
            }
            Some(session) if session.status != SessionStatus::Connected => {
                let qr = self.fetch_qr(&session_id).await;
                json!({
                    "status": "disconnected",
                    "session_id": session_id,
                    "qr_code": qr,
                    "message": "System session needs reconnection",
                })
            }
            Some(session) => {
                json!({
                    "status": "connected",
                    "session_id": session_id,
                    "connected_phone": session.phone_number.clone(),
                })
            }
        }
    }

    async fn fetch_qr(&self, session_id: &str) -> Value {
        match self.client.get_qr_code(session_id).await {
            Ok(qr) => json!({"qr_code": qr.qr_code, "timeout": qr.timeout}),
            Err(BridgeError::Session(reason)) => {
                tracing::warn!("QR code unavailable for {session_id}: {reason}");
                Value::Null
            }
            Err(e) => {
                tracing::error!("failed to fetch QR code for {session_id}: {e}");
                Value::Null
            }
        }
    }

    /// Bridge health plus session counts.
    pub async fn check_health(&self) -> Value {
        match self.client.list_sessions().await {
            Ok(sessions) => {
                let active = sessions
                    .iter()
                    .filter(|s| s.status == SessionStatus::Connected)
                    .count();
                json!({
                    "status": "healthy",
                    "total_sessions": sessions.len(),
                    "active_sessions": active,
                    "bridge_url": self.client.base_url(),
                    "webhook_url": self.webhook_url.clone(),
                })
            }
            Err(e) => {
                tracing::error!("bridge health check failed: {e}");
                json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                    "bridge_url": self.client.base_url(),
                })
            }
        }
    }
}
