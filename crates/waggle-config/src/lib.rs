//! Environment-driven configuration.
//!
//! Every option the platform consumes is read from the environment once at
//! startup; the resulting [`Settings`] value is passed down explicitly.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Runtime settings, one field per recognized environment option.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the sqlite database file.
    pub database_url: String,
    /// Queue store connection URL.
    pub redis_url: String,
    /// Base URL of the WhatsApp bridge service.
    pub bridge_url: String,
    /// Bridge HTTP timeout in seconds, clamped to 5..=300.
    pub bridge_timeout_secs: u64,
    /// Phone number that identifies messages addressed to the system.
    pub system_number: String,
    /// Base URL handed to the bridge as the webhook callback host.
    pub webhook_base_url: String,
    /// Optional HMAC secret for webhook signature validation.
    pub webhook_secret: Option<String>,
    /// Passphrase for API-key encryption (at least 32 chars).
    pub encryption_key: String,
    /// JWT signing key for the outer auth surface (at least 32 chars).
    pub secret_key: Option<String>,
    /// Number of message processor workers.
    pub worker_count: usize,
    /// Key prefix for the queue lists.
    pub queue_prefix: String,
    /// Per-record retry ceiling.
    pub queue_max_retries: u32,
    /// Base backoff delay in seconds.
    pub queue_retry_delay_secs: u64,
    /// TTL refreshed on each queue key per enqueue, in seconds.
    pub queue_ttl_secs: i64,
    /// Health monitor interval in seconds.
    pub monitor_interval_secs: u64,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build settings from an explicit variable map. Used by `from_env` and
    /// directly by tests to stay hermetic.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| vars.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let encryption_key = get("ENCRYPTION_KEY")
            .ok_or(ConfigError::Missing("ENCRYPTION_KEY"))?
            .to_string();
        if encryption_key.len() < 32 {
            return Err(ConfigError::Invalid {
                var: "ENCRYPTION_KEY",
                reason: "must be at least 32 characters".to_string(),
            });
        }

        let secret_key = get("SECRET_KEY").map(str::to_string);
        if let Some(key) = &secret_key {
            if key.len() < 32 {
                return Err(ConfigError::Invalid {
                    var: "SECRET_KEY",
                    reason: "must be at least 32 characters".to_string(),
                });
            }
        }

        let system_number = get("WHATSAPP_SYSTEM_NUMBER")
            .ok_or(ConfigError::Missing("WHATSAPP_SYSTEM_NUMBER"))?
            .to_string();

        let bridge_timeout_secs =
            parse_u64(get("WHATSAPP_BRIDGE_TIMEOUT"), "WHATSAPP_BRIDGE_TIMEOUT", 30)?
                .clamp(5, 300);

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or("waggle.db").to_string(),
            redis_url: get("REDIS_URL")
                .unwrap_or("redis://localhost:6379")
                .to_string(),
            bridge_url: get("WHATSAPP_BRIDGE_URL")
                .unwrap_or("http://localhost:3000")
                .to_string(),
            bridge_timeout_secs,
            system_number,
            webhook_base_url: get("WEBHOOK_BASE_URL")
                .unwrap_or("http://localhost:8001")
                .to_string(),
            webhook_secret: get("WEBHOOK_SECRET").map(str::to_string),
            encryption_key,
            secret_key,
            worker_count: parse_u64(
                get("MESSAGE_PROCESSOR_WORKERS"),
                "MESSAGE_PROCESSOR_WORKERS",
                3,
            )? as usize,
            queue_prefix: get("MESSAGE_QUEUE_PREFIX")
                .unwrap_or("waggle:queue:")
                .to_string(),
            queue_max_retries: parse_u64(
                get("MESSAGE_QUEUE_MAX_RETRIES"),
                "MESSAGE_QUEUE_MAX_RETRIES",
                3,
            )? as u32,
            queue_retry_delay_secs: parse_u64(
                get("MESSAGE_QUEUE_RETRY_DELAY"),
                "MESSAGE_QUEUE_RETRY_DELAY",
                60,
            )?,
            queue_ttl_secs: parse_u64(get("MESSAGE_QUEUE_TTL"), "MESSAGE_QUEUE_TTL", 86400)?
                as i64,
            monitor_interval_secs: parse_u64(get("MONITOR_INTERVAL"), "MONITOR_INTERVAL", 30)?,
        })
    }

    /// Full URL the bridge should deliver webhooks to.
    pub fn webhook_url(&self) -> String {
        format!(
            "{}/api/v1/webhooks/whatsapp",
            self.webhook_base_url.trim_end_matches('/')
        )
    }
}

fn parse_u64(
    value: Option<&str>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            var,
            reason: format!("expected an integer, got {raw:?}"),
        }),
    }
}
