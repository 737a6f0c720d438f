//! Typed client for the WhatsApp Bridge HTTP API.
//!
//! The bridge is an external process translating WhatsApp's protocol into
//! HTTP. It exposes:
//! - GET    /health                     - service health
//! - POST   /sessions                   - create a session
//! - GET    /sessions                   - list sessions
//! - GET    /sessions/{id}              - session status
//! - DELETE /sessions/{id}              - delete a session
//! - GET    /sessions/{id}/qr          - QR code for linking
//! - POST   /sessions/{id}/messages    - send a message

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use waggle_schema::{jid, SessionStatus, JID_SUFFIX};

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Transport failure reaching the bridge. Retriable by callers.
    #[error("failed to connect to WhatsApp bridge")]
    Connection(#[source] reqwest::Error),
    /// Bridge-level session error (missing, not connected, already exists).
    #[error("{0}")]
    Session(String),
    /// Any other bridge-side failure.
    #[error("{0}")]
    Bridge(String),
}

/// Session status as reported by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSessionStatus {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_qr_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrCodeResponse {
    pub qr_code: String,
    /// Seconds until the QR code expires.
    #[serde(default = "default_qr_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize)]
struct CreateSessionRequest<'a> {
    session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_url: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
struct SendMessageRequest<'a> {
    session_id: &'a str,
    recipient_jid: String,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    quoted_message_id: Option<&'a str>,
}

fn default_send_status() -> String {
    "sent".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_send_status")]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeHealth {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Append the WhatsApp suffix when the recipient is a bare phone number.
fn normalize_recipient(recipient: &str) -> String {
    if recipient.ends_with(JID_SUFFIX) {
        recipient.to_string()
    } else {
        jid(recipient)
    }
}

/// Async client for the bridge API. Constructing the client opens it;
/// dropping it closes the underlying connection pool.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    base_url: String,
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl BridgeClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        webhook_url: Option<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            webhook_url,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health_check(&self) -> Result<BridgeHealth, BridgeError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(BridgeError::Connection)?;
        if !resp.status().is_success() {
            return Err(BridgeError::Bridge(format!(
                "bridge health check returned {}",
                resp.status()
            )));
        }
        parse_json(resp).await
    }

    pub async fn create_session(
        &self,
        session_id: &str,
    ) -> Result<BridgeSessionStatus, BridgeError> {
        let url = format!("{}/sessions", self.base_url);
        let payload = CreateSessionRequest {
            session_id,
            webhook_url: self.webhook_url.as_deref(),
        };
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(BridgeError::Connection)?;

        match resp.status() {
            status if status.is_success() => parse_json(resp).await,
            StatusCode::CONFLICT => Err(BridgeError::Session(format!(
                "session {session_id} already exists"
            ))),
            status => Err(BridgeError::Session(format!(
                "failed to create session {session_id}: {status}"
            ))),
        }
    }

    pub async fn get_session_status(
        &self,
        session_id: &str,
    ) -> Result<BridgeSessionStatus, BridgeError> {
        let url = format!("{}/sessions/{session_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(BridgeError::Connection)?;

        match resp.status() {
            status if status.is_success() => parse_json(resp).await,
            StatusCode::NOT_FOUND => Err(BridgeError::Session(format!(
                "session {session_id} not found"
            ))),
            status => Err(BridgeError::Session(format!(
                "failed to get session {session_id} status: {status}"
            ))),
        }
    }

    pub async fn get_qr_code(&self, session_id: &str) -> Result<QrCodeResponse, BridgeError> {
        let url = format!("{}/sessions/{session_id}/qr", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(BridgeError::Connection)?;

        match resp.status() {
            status if status.is_success() => parse_json(resp).await,
            StatusCode::NOT_FOUND => Err(BridgeError::Session(format!(
                "session {session_id} not found"
            ))),
            StatusCode::BAD_REQUEST => {
                Err(BridgeError::Session("session already connected".to_string()))
            }
            status => Err(BridgeError::Session(format!(
                "failed to get QR code for {session_id}: {status}"
            ))),
        }
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        recipient: &str,
        content: &str,
        quoted_message_id: Option<&str>,
    ) -> Result<SendMessageResponse, BridgeError> {
        let url = format!("{}/sessions/{session_id}/messages", self.base_url);
        let payload = SendMessageRequest {
            session_id,
            recipient_jid: normalize_recipient(recipient),
            content,
            quoted_message_id,
        };
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(BridgeError::Connection)?;

        match resp.status() {
            status if status.is_success() => parse_json(resp).await,
            StatusCode::NOT_FOUND => Err(BridgeError::Session(format!(
                "session {session_id} not found"
            ))),
            StatusCode::BAD_REQUEST => {
                Err(BridgeError::Session("session not connected".to_string()))
            }
            status => Err(BridgeError::Bridge(format!(
                "failed to send message: {status}"
            ))),
        }
    }

    /// Delete a session. `Ok(false)` when the bridge reports it absent.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, BridgeError> {
        let url = format!("{}/sessions/{session_id}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(BridgeError::Connection)?;

        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BridgeError::Session(format!(
                "failed to delete session {session_id}: {status}"
            ))),
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<BridgeSessionStatus>, BridgeError> {
        let url = format!("{}/sessions", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(BridgeError::Connection)?;
        if !resp.status().is_success() {
            return Err(BridgeError::Bridge(format!(
                "failed to list sessions: {}",
                resp.status()
            )));
        }
        parse_json(resp).await
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, BridgeError> {
    resp.json()
        .await
        .map_err(|e| BridgeError::Bridge(format!("invalid response from bridge: {e}")))
}
