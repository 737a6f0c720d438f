use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::task;

use waggle_schema::{
    AuthCode, LlmConfig, LlmProvider, SessionStatus, SessionType, User, WaSession,
};

use crate::migrations::run_migrations;

/// Sqlite-backed persistence for users, sessions, messages, LLM configs and
/// auth codes. Cheap to clone; all operations run on the blocking pool.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            f(&mut conn)
        })
        .await?
    }

    // ============================================================
    // Users
    // ============================================================

    /// Look a user up by phone number, creating one on first contact.
    pub async fn get_or_create_user(
        &self,
        phone_number: &str,
        display_name: Option<String>,
    ) -> Result<User> {
        let phone = phone_number.to_owned();
        self.call(move |conn| {
            if let Some(user) = query_user_by_phone(conn, &phone)? {
                return Ok(user);
            }
            conn.execute(
                "INSERT INTO users (phone_number, display_name, is_active, first_seen)
                 VALUES (?1, ?2, 1, ?3)",
                params![phone, display_name, encode_ts(Utc::now())],
            )?;
            let id = conn.last_insert_rowid();
            query_user_by_id(conn, id)?.ok_or_else(|| anyhow!("user {id} vanished after insert"))
        })
        .await
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        self.call(move |conn| query_user_by_id(conn, id)).await
    }

    pub async fn user_by_phone(&self, phone_number: &str) -> Result<Option<User>> {
        let phone = phone_number.to_owned();
        self.call(move |conn| query_user_by_phone(conn, &phone)).await
    }

    pub async fn touch_last_active(&self, user_id: i64) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE users SET last_active = ?1 WHERE id = ?2",
                params![encode_ts(Utc::now()), user_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a user and, through cascade, everything the user owns.
    pub async fn delete_user(&self, user_id: i64) -> Result<bool> {
        self.call(move |conn| {
            let affected = conn.execute("DELETE FROM users WHERE id = ?1", [user_id])?;
            Ok(affected > 0)
        })
        .await
    }

    /// Connectivity probe plus coarse row counts, for health reporting.
    pub async fn health_snapshot(&self) -> Result<(i64, i64)> {
        self.call(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |r| r.get(0))?;
            let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
            let messages: i64 =
                conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
            Ok((users, messages))
        })
        .await
    }

    // ============================================================
    // Sessions
    // ============================================================

    /// The connected main session for a user, created when absent.
    pub async fn get_or_create_main_session(&self, user_id: i64) -> Result<WaSession> {
        self.call(move |conn| get_or_create_main_session(conn, user_id))
            .await
    }

    // ============================================================
    // LLM configs
    // ============================================================

    /// Save a new LLM configuration, deactivating any prior ones in the
    /// same transaction so exactly one config per user is active.
    pub async fn save_llm_config(
        &self,
        user_id: i64,
        provider: LlmProvider,
        api_key_encrypted: String,
        model_settings: Value,
    ) -> Result<LlmConfig> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE llm_configs SET is_active = 0 WHERE user_id = ?1",
                [user_id],
            )?;
            tx.execute(
                "INSERT INTO llm_configs (user_id, provider, api_key_encrypted, model_settings, is_active)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![
                    user_id,
                    provider.as_str(),
                    api_key_encrypted,
                    model_settings.to_string()
                ],
            )?;
            let id = tx.last_insert_rowid();
            let config = tx
                .query_row(
                    "SELECT id, user_id, provider, api_key_encrypted, model_settings, is_active
                     FROM llm_configs WHERE id = ?1",
                    [id],
                    row_to_llm_config,
                )?;
            tx.commit()?;
            Ok(config)
        })
        .await
    }

    pub async fn active_llm_config(&self, user_id: i64) -> Result<Option<LlmConfig>> {
        self.call(move |conn| {
            let config = conn
                .query_row(
                    "SELECT id, user_id, provider, api_key_encrypted, model_settings, is_active
                     FROM llm_configs WHERE user_id = ?1 AND is_active = 1",
                    [user_id],
                    row_to_llm_config,
                )
                .optional()?;
            Ok(config)
        })
        .await
    }

    // ============================================================
    // Auth codes
    // ============================================================

    pub async fn create_auth_code(
        &self,
        user_id: i64,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<AuthCode> {
        if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
            bail!("auth code must be six decimal digits");
        }
        let code = code.to_owned();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO auth_codes (user_id, code, used, expires_at)
                 VALUES (?1, ?2, 0, ?3)",
                params![user_id, code, encode_ts(expires_at)],
            )?;
            let id = conn.last_insert_rowid();
            let auth_code = conn.query_row(
                "SELECT id, user_id, code, used, expires_at FROM auth_codes WHERE id = ?1",
                [id],
                row_to_auth_code,
            )?;
            Ok(auth_code)
        })
        .await
    }

    /// Consume an unexpired one-time code. Marks it used; returns `None`
    /// when the code is unknown, already used, or expired.
    pub async fn consume_auth_code(&self, code: &str) -> Result<Option<AuthCode>> {
        let code = code.to_owned();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let found = tx
                .query_row(
                    "SELECT id, user_id, code, used, expires_at FROM auth_codes
                     WHERE code = ?1 AND used = 0 AND expires_at > ?2",
                    params![code, encode_ts(Utc::now())],
                    row_to_auth_code,
                )
                .optional()?;
            let result = match found {
                Some(mut auth_code) => {
                    tx.execute("UPDATE auth_codes SET used = 1 WHERE id = ?1", [auth_code.id])?;
                    auth_code.used = true;
                    Some(auth_code)
                }
                None => None,
            };
            tx.commit()?;
            Ok(result)
        })
        .await
    }
}

// ============================================================
// Row mappers and shared helpers
// ============================================================

pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width micros keep rfc3339 strings lexicographically ordered.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn conversion_err(what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unrecognized {what}: {raw}").into(),
    )
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    let first_seen: String = row.get("first_seen")?;
    let last_active: Option<String> = row.get("last_active")?;
    Ok(User {
        id: row.get("id")?,
        phone_number: row.get("phone_number")?,
        display_name: row.get("display_name")?,
        is_active: row.get("is_active")?,
        is_admin: row.get("is_admin")?,
        first_seen: decode_ts(&first_seen)?,
        last_active: last_active.as_deref().map(decode_ts).transpose()?,
    })
}

fn row_to_session(row: &Row) -> rusqlite::Result<WaSession> {
    let session_type: String = row.get("session_type")?;
    let status: String = row.get("status")?;
    let connected_at: Option<String> = row.get("connected_at")?;
    let created_at: String = row.get("created_at")?;
    Ok(WaSession {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        session_type: SessionType::parse(&session_type)
            .ok_or_else(|| conversion_err("session type", &session_type))?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| conversion_err("session status", &status))?,
        connected_at: connected_at.as_deref().map(decode_ts).transpose()?,
        created_at: decode_ts(&created_at)?,
    })
}

fn row_to_llm_config(row: &Row) -> rusqlite::Result<LlmConfig> {
    let provider: String = row.get("provider")?;
    let settings: String = row.get("model_settings")?;
    Ok(LlmConfig {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        provider: LlmProvider::parse(&provider)
            .ok_or_else(|| conversion_err("provider", &provider))?,
        api_key_encrypted: row.get("api_key_encrypted")?,
        model_settings: serde_json::from_str(&settings)
            .map_err(|_| conversion_err("model settings", &settings))?,
        is_active: row.get("is_active")?,
    })
}

fn row_to_auth_code(row: &Row) -> rusqlite::Result<AuthCode> {
    let expires_at: String = row.get("expires_at")?;
    Ok(AuthCode {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        code: row.get("code")?,
        used: row.get("used")?,
        expires_at: decode_ts(&expires_at)?,
    })
}

pub(crate) fn query_user_by_id(conn: &Connection, id: i64) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, phone_number, display_name, is_active, is_admin, first_seen, last_active
             FROM users WHERE id = ?1",
            [id],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

fn query_user_by_phone(conn: &Connection, phone: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, phone_number, display_name, is_active, is_admin, first_seen, last_active
             FROM users WHERE phone_number = ?1",
            [phone],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub(crate) fn get_or_create_main_session(conn: &Connection, user_id: i64) -> Result<WaSession> {
    let existing = conn
        .query_row(
            "SELECT id, user_id, session_type, status, connected_at, created_at
             FROM wa_sessions
             WHERE user_id = ?1 AND session_type = 'main' AND status = 'connected'
             LIMIT 1",
            [user_id],
            row_to_session,
        )
        .optional()?;
    if let Some(session) = existing {
        return Ok(session);
    }

    let now = encode_ts(Utc::now());
    conn.execute(
        "INSERT INTO wa_sessions (user_id, session_type, status, connected_at, created_at)
         VALUES (?1, 'main', 'connected', ?2, ?2)",
        params![user_id, now],
    )?;
    let id = conn.last_insert_rowid();
    let session = conn.query_row(
        "SELECT id, user_id, session_type, status, connected_at, created_at
         FROM wa_sessions WHERE id = ?1",
        [id],
        row_to_session,
    )?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn get_or_create_user_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let a = store
            .get_or_create_user("+1234567890", Some("User 7890".to_string()))
            .await
            .unwrap();
        let b = store.get_or_create_user("+1234567890", None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.display_name.as_deref(), Some("User 7890"));
        assert!(a.is_active);
        assert!(!a.is_admin);
    }

    #[tokio::test]
    async fn main_session_reused_once_created() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("+111", None).await.unwrap();
        let a = store.get_or_create_main_session(user.id).await.unwrap();
        let b = store.get_or_create_main_session(user.id).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, SessionStatus::Connected);
        assert_eq!(a.session_type, SessionType::Main);
        assert!(a.connected_at.is_some());
    }

    #[tokio::test]
    async fn single_active_llm_config_invariant() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("+111", None).await.unwrap();

        let first = store
            .save_llm_config(user.id, LlmProvider::OpenAi, "ct1".into(), json!({"model": "gpt-4o"}))
            .await
            .unwrap();
        assert!(first.is_active);

        let second = store
            .save_llm_config(
                user.id,
                LlmProvider::Anthropic,
                "ct2".into(),
                json!({"model": "claude-3-opus-20240229"}),
            )
            .await
            .unwrap();
        assert!(second.is_active);

        let active = store.active_llm_config(user.id).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.provider, LlmProvider::Anthropic);

        // Exactly one active row in the table.
        let count = store
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM llm_configs WHERE user_id = ?1 AND is_active = 1",
                    [user.id],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn deleting_user_cascades() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("+111", None).await.unwrap();
        store.get_or_create_main_session(user.id).await.unwrap();
        store
            .save_llm_config(user.id, LlmProvider::OpenAi, "ct".into(), json!({}))
            .await
            .unwrap();

        assert!(store.delete_user(user.id).await.unwrap());
        assert!(store.user_by_id(user.id).await.unwrap().is_none());
        assert!(store.active_llm_config(user.id).await.unwrap().is_none());

        let sessions = store
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM wa_sessions WHERE user_id = ?1",
                    [user.id],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(sessions, 0);
    }

    #[tokio::test]
    async fn auth_code_is_one_time() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("+111", None).await.unwrap();
        store
            .create_auth_code(user.id, "123456", Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        let consumed = store.consume_auth_code("123456").await.unwrap().unwrap();
        assert!(consumed.used);
        assert!(store.consume_auth_code("123456").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_auth_code_rejected() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("+111", None).await.unwrap();
        store
            .create_auth_code(user.id, "654321", Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        assert!(store.consume_auth_code("654321").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reopening_on_disk_database_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waggle.db");
        let path = path.to_str().unwrap();

        let user_id = {
            let store = Store::open(path).unwrap();
            let user = store.get_or_create_user("+111", None).await.unwrap();
            user.id
        };

        let store = Store::open(path).unwrap();
        let user = store.user_by_id(user_id).await.unwrap().unwrap();
        assert_eq!(user.phone_number, "+111");
    }

    #[tokio::test]
    async fn auth_code_format_enforced() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_or_create_user("+111", None).await.unwrap();
        let expiry = Utc::now() + Duration::minutes(5);
        assert!(store.create_auth_code(user.id, "12345", expiry).await.is_err());
        assert!(store.create_auth_code(user.id, "abc123", expiry).await.is_err());
    }
}
