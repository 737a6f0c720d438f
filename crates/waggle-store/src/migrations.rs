use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;

type Migration = (i64, &'static str);

fn migrations() -> Vec<Migration> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone_number TEXT NOT NULL UNIQUE,
                display_name TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_admin INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_active TEXT
            );

            CREATE TABLE IF NOT EXISTS wa_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                session_type TEXT NOT NULL,
                status TEXT NOT NULL,
                connected_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_wa_sessions_user ON wa_sessions(user_id, status);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                session_id INTEGER NOT NULL REFERENCES wa_sessions(id) ON DELETE CASCADE,
                sender_jid TEXT NOT NULL,
                recipient_jid TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT,
                caption TEXT,
                reply_to_id INTEGER REFERENCES messages(id),
                media_metadata TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_messages_user_ts ON messages(user_id, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_jid);
            CREATE INDEX IF NOT EXISTS idx_messages_wamid
                ON messages(json_extract(media_metadata, '$.whatsapp_message_id'));
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS llm_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                provider TEXT NOT NULL,
                api_key_encrypted TEXT NOT NULL,
                model_settings TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_llm_configs_user ON llm_configs(user_id, is_active);

            CREATE TABLE IF NOT EXISTS auth_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                code TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_auth_codes_code ON auth_codes(code);
            "#,
        ),
    ]
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let mut stmt = conn.prepare("SELECT version FROM __schema_version")?;
    let applied: HashSet<i64> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    for (version, sql) in migrations() {
        if applied.contains(&version) {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO __schema_version (version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM __schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, migrations().len() as i64);
    }
}
