use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suffix that turns a bare phone number into a WhatsApp JID.
pub const JID_SUFFIX: &str = "@s.whatsapp.net";

/// Build the WhatsApp JID for a phone number.
pub fn jid(phone: &str) -> String {
    format!("{phone}{JID_SUFFIX}")
}

/// Strip the WhatsApp JID suffix, returning the bare phone number.
pub fn strip_jid(jid: &str) -> &str {
    jid.strip_suffix(JID_SUFFIX).unwrap_or(jid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    Video,
    Document,
}

impl MessageType {
    /// Map a bridge `media_type` onto a message type, falling back to text.
    pub fn from_media_type(media_type: Option<&str>) -> Self {
        match media_type {
            Some("image") => Self::Image,
            Some("audio") => Self::Audio,
            Some("video") => Self::Video,
            Some("document") => Self::Document,
            _ => Self::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    QrPending,
    Connected,
    Disconnected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qr_pending" => Some(Self::QrPending),
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Main,
    User,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "main" => Some(Self::Main),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// LLM providers a user can configure. All of them speak the
/// OpenAI-compatible chat completions API, differing only in base URL and
/// default model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Google,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Ollama => "ollama",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google" => Some(Self::Google),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Anthropic => "claude-3-opus-20240229",
            Self::Google => "gemini-pro",
            Self::Ollama => "llama2",
        }
    }

    /// Base URL override for OpenAI-compatible endpoints. `None` means the
    /// client's default (api.openai.com).
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => None,
            Self::Anthropic => Some("https://api.anthropic.com/v1"),
            Self::Google => Some("https://generativelanguage.googleapis.com/v1beta"),
            Self::Ollama => Some("http://localhost:11434/v1"),
        }
    }
}

/// A WhatsApp user. Owns sessions, messages, auth codes and LLM configs;
/// deleting a user cascades to all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub phone_number: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub is_admin: bool,
    pub first_seen: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
}

impl User {
    pub fn jid(&self) -> String {
        jid(&self.phone_number)
    }
}

/// A WhatsApp connection instance owned by a user. Messages attach to the
/// single connected `main` session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaSession {
    pub id: i64,
    pub user_id: i64,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub connected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A stored WhatsApp message.
///
/// Direction is never stored; it is derived from the sender/recipient JIDs
/// and the owning user's phone number at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub user_id: i64,
    pub session_id: i64,
    pub sender_jid: String,
    pub recipient_jid: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub caption: Option<String>,
    pub reply_to_id: Option<i64>,
    pub media_metadata: Option<Value>,
}

impl Message {
    /// Derive the direction relative to the owning user's phone number.
    pub fn direction(&self, user_phone: &str) -> MessageDirection {
        let user_jid = jid(user_phone);
        if self.sender_jid == user_jid {
            MessageDirection::Incoming
        } else if self.recipient_jid == user_jid {
            MessageDirection::Outgoing
        } else {
            MessageDirection::System
        }
    }

    /// The originating WhatsApp message id, when carried in the metadata.
    pub fn whatsapp_message_id(&self) -> Option<&str> {
        self.media_metadata
            .as_ref()
            .and_then(|m| m.get("whatsapp_message_id"))
            .and_then(Value::as_str)
    }

    /// Delivery status recorded by `message.sent` / `message.failed` events.
    pub fn delivery_status(&self) -> Option<&str> {
        self.media_metadata
            .as_ref()
            .and_then(|m| m.get("status"))
            .and_then(Value::as_str)
    }
}

/// Input record for storing a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreate {
    pub content: Option<String>,
    pub direction: MessageDirection,
    pub message_type: MessageType,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub whatsapp_message_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub sender_jid: Option<String>,
    #[serde(default)]
    pub recipient_jid: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<i64>,
}

impl MessageCreate {
    /// A plain text message with only a direction and content.
    pub fn text(direction: MessageDirection, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            direction,
            message_type: MessageType::Text,
            caption: None,
            whatsapp_message_id: None,
            metadata: None,
            sender_jid: None,
            recipient_jid: None,
            reply_to_id: None,
        }
    }

    pub fn with_whatsapp_message_id(mut self, id: impl Into<String>) -> Self {
        self.whatsapp_message_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_jids(mut self, sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        self.sender_jid = Some(sender.into());
        self.recipient_jid = Some(recipient.into());
        self
    }
}

/// A user's LLM provider configuration. At most one per user is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub id: i64,
    pub user_id: i64,
    pub provider: LlmProvider,
    pub api_key_encrypted: String,
    pub model_settings: Value,
    pub is_active: bool,
}

impl LlmConfig {
    pub fn model(&self) -> Option<&str> {
        self.model_settings.get("model").and_then(Value::as_str)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.model_settings.get("temperature").and_then(Value::as_f64)
    }

    pub fn max_tokens(&self) -> Option<u64> {
        self.model_settings.get("max_tokens").and_then(Value::as_u64)
    }

    pub fn custom_instructions(&self) -> Option<&str> {
        self.model_settings
            .get("custom_instructions")
            .and_then(Value::as_str)
    }

    /// Endpoint override for self-hosted or proxied deployments.
    pub fn base_url(&self) -> Option<&str> {
        self.model_settings.get("base_url").and_then(Value::as_str)
    }
}

/// One-time six-digit login code delivered over WhatsApp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCode {
    pub id: i64,
    pub user_id: i64,
    pub code: String,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
}

/// Aggregate statistics over one user's message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total_messages: i64,
    pub messages_sent: i64,
    pub messages_received: i64,
    pub first_message_date: Option<DateTime<Utc>>,
    pub last_message_date: Option<DateTime<Utc>>,
    pub average_messages_per_day: f64,
}

impl ConversationStats {
    pub fn empty() -> Self {
        Self {
            total_messages: 0,
            messages_sent: 0,
            messages_received: 0,
            first_message_date: None,
            last_message_date: None,
            average_messages_per_day: 0.0,
        }
    }
}

/// Outcome of one agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub content: String,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

// ============================================================
// Webhook wire types
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "message.sent")]
    MessageSent,
    #[serde(rename = "message.failed")]
    MessageFailed,
    #[serde(rename = "connection.status")]
    ConnectionStatus,
    #[serde(other)]
    Unknown,
}

/// Envelope delivered by the bridge to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: WebhookEventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReceivedData {
    pub from_number: String,
    pub to_number: String,
    pub message_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

fn default_sent_status() -> String {
    "sent".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSentData {
    pub message_id: String,
    #[serde(default = "default_sent_status")]
    pub status: String,
    pub to_number: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFailedData {
    pub message_id: String,
    pub error: String,
    pub to_number: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatusData {
    pub status: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}
