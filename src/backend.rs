//! Key-value backend seam
//!
//! The caching core talks to its shared backend through [`CacheBackend`],
//! which covers the small protocol subset it depends on: GET, SET with
//! expiry, DEL, KEYS (admin/invalidation only, never on a hot path), EXISTS,
//! TTL, and PING for health probes.
//!
//! [`RedisBackend`] is the production implementation over a Redis connection
//! manager. [`MemoryBackend`] implements the same protocol in-process for
//! tests and local development.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;

use crate::CacheError;

/// Protocol subset of the shared key-value backend.
///
/// All values are opaque strings; serialization is the caller's concern.
/// Implementations are externally synchronized (the backend is shared across
/// instances) and every mutation from this core is best-effort.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch a value, `None` on miss.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value with an expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Delete keys. An empty slice is a no-op.
    async fn del(&self, keys: &[String]) -> Result<(), CacheError>;

    /// List keys matching a glob pattern. Admin/invalidation use only.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Whether a key currently exists.
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remaining TTL for a key, `None` if missing or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Redis implementation of the backend protocol.
///
/// Holds a [`redis::aio::ConnectionManager`], which multiplexes and
/// reconnects internally; clones are cheap and share the connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis at the given URL.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys.to_vec()).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.keys::<_, Vec<String>>(pattern).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(key).await?;
        // -2 = missing, -1 = no expiry
        if ttl < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(ttl as u64)))
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// In-memory implementation of the backend protocol.
///
/// Expired entries are dropped lazily on read. Intended for tests and local
/// development; it is not a distributed cache.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if !e.is_expired() => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it so KEYS and EXISTS stay consistent
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired()) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_owned(),
            MemoryEntry {
                value: value.to_owned(),
                expires_at: Some(Instant::now() + ttl.max(Duration::from_secs(1))),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| !e.is_expired() && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Redis-style glob matching supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            Some(b'?') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some(c) => t.first() == Some(c) && inner(&p[1..], &t[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
