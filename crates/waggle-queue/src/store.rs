//! List-store abstraction over the queue backend.
//!
//! The queue only needs a handful of atomic list operations. `RedisListStore`
//! is the production backend; `MemoryListStore` offers the same atomicity
//! under a single mutex for tests and bare local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::{json, Value};

#[async_trait]
pub trait ListStore: Send + Sync {
    /// Push a value onto the head of a list.
    async fn push_left(&self, key: &str, value: &str) -> Result<()>;
    /// Atomically pop the tail of `source` and push it onto the head of
    /// `destination`. The popped value is visible to exactly one caller.
    async fn pop_right_push_left(&self, source: &str, destination: &str)
        -> Result<Option<String>>;
    /// Remove the first occurrence of `value`, returning how many were removed.
    async fn remove_first(&self, key: &str, value: &str) -> Result<usize>;
    /// All values, head to tail.
    async fn range(&self, key: &str) -> Result<Vec<String>>;
    async fn len(&self, key: &str) -> Result<usize>;
    async fn expire(&self, key: &str, seconds: i64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn ping(&self) -> Result<()>;
    /// Backend diagnostics for health reporting.
    async fn server_info(&self) -> Result<Value>;
    /// Release the backend connection. Default: nothing to release.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis-backed list store.
pub struct RedisListStore {
    manager: ConnectionManager,
}

impl RedisListStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl ListStore for RedisListStore {
    async fn push_left(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("LPUSH").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn pop_right_push_left(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(source)
            .arg(destination)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn remove_first(&self, key: &str, value: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        let removed: usize = redis::cmd("LREM")
            .arg(key)
            .arg(1)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn len(&self, key: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn server_info(&self) -> Result<Value> {
        let mut conn = self.manager.clone();
        let raw: String = redis::cmd("INFO").query_async(&mut conn).await?;
        let mut info = serde_json::Map::new();
        for line in raw.lines() {
            if let Some((key, value)) = line.split_once(':') {
                if matches!(key, "used_memory_human" | "connected_clients" | "redis_version") {
                    info.insert(key.to_string(), Value::String(value.trim().to_string()));
                }
            }
        }
        Ok(Value::Object(info))
    }
}

#[derive(Default)]
struct MemoryInner {
    lists: HashMap<String, VecDeque<String>>,
    ttls: HashMap<String, i64>,
}

/// In-process list store with redis list semantics.
#[derive(Default)]
pub struct MemoryListStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| anyhow!("list store mutex poisoned"))
    }

    /// TTL last set on a key, for tests.
    pub fn ttl(&self, key: &str) -> Option<i64> {
        self.inner.lock().ok()?.ttls.get(key).copied()
    }
}

#[async_trait]
impl ListStore for MemoryListStore {
    async fn push_left(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn pop_right_push_left(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<String>> {
        let mut inner = self.lock()?;
        let popped = inner.lists.get_mut(source).and_then(VecDeque::pop_back);
        if let Some(value) = &popped {
            inner
                .lists
                .entry(destination.to_string())
                .or_default()
                .push_front(value.clone());
        }
        Ok(popped)
    }

    async fn remove_first(&self, key: &str, value: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        if let Some(list) = inner.lists.get_mut(key) {
            if let Some(pos) = list.iter().position(|v| v == value) {
                list.remove(pos);
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, key: &str) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ttls.insert(key.to_string(), seconds);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.lists.remove(key);
        inner.ttls.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn server_info(&self) -> Result<Value> {
        Ok(json!({"backend": "memory"}))
    }
}
