//! Namespaced key-value cache over the shared backend
//!
//! Thin wrapper that owns key generation and routes every backend call
//! through the circuit breaker with an explicit per-call timeout.
//!
//! ## Key format
//!
//! `"{namespace}:{base}[:{k1}={v1}:{k2}={v2}...]"` with params sorted
//! lexicographically by field name, so two semantically identical parameter
//! sets always produce the same key.
//!
//! Failure posture: reads degrade to a miss, writes and deletes are
//! best-effort and never raise. Losing a cache write is a performance issue,
//! not a correctness one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backend::CacheBackend;
use crate::{CacheConfig, CacheError, CircuitBreaker};

/// Namespaced, breaker-protected view of the shared key-value backend.
pub struct KeyValueCache {
    backend: Arc<dyn CacheBackend>,
    breaker: Arc<CircuitBreaker>,
    namespace: String,
    op_timeout: Duration,
}

impl KeyValueCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        breaker: Arc<CircuitBreaker>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            backend,
            breaker,
            namespace: config.namespace.clone(),
            op_timeout: config.op_timeout,
        }
    }

    /// Build a deterministic namespaced key.
    ///
    /// `generate_key("favorite", &[("owner", "u1"), ("entity", "a9")])` and
    /// the same params in any other order produce the identical key.
    pub fn generate_key(&self, base: &str, params: &[(&str, &str)]) -> String {
        let mut key = format!("{}:{}", self.namespace, base);
        if !params.is_empty() {
            let mut sorted = params.to_vec();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            for (name, value) in sorted {
                key.push(':');
                key.push_str(name);
                key.push('=');
                key.push_str(value);
            }
        }
        key
    }

    /// Prefix an arbitrary suffix or pattern with the namespace.
    pub fn namespaced(&self, suffix: &str) -> String {
        format!("{}:{}", self.namespace, suffix)
    }

    /// Fetch a raw value. Backend errors and an open breaker both read as a
    /// miss; the caller falls back to its fetcher.
    pub async fn get(&self, key: &str) -> Option<String> {
        let backend = Arc::clone(&self.backend);
        let op_timeout = self.op_timeout;
        let owned = key.to_owned();
        let result = self
            .breaker
            .execute(async move {
                tokio::time::timeout(op_timeout, backend.get(&owned))
                    .await
                    .map_err(|_| {
                        CacheError::BackendUnavailable(format!("GET {} timed out", owned))
                    })?
            })
            .await;

        match result {
            Ok(value) => value,
            Err(CacheError::BackendUnavailable(reason)) => {
                debug!("cache GET {} unavailable ({}); treating as miss", key, reason);
                None
            }
            Err(e) => {
                warn!("cache GET {} failed: {}. Treating as miss.", key, e);
                None
            }
        }
    }

    /// Store a value best-effort. Errors are logged and suppressed.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let backend = Arc::clone(&self.backend);
        let op_timeout = self.op_timeout;
        let owned_key = key.to_owned();
        let owned_value = value.to_owned();
        let result = self
            .breaker
            .execute(async move {
                tokio::time::timeout(op_timeout, backend.set_ex(&owned_key, &owned_value, ttl))
                    .await
                    .map_err(|_| {
                        CacheError::BackendUnavailable(format!("SET {} timed out", owned_key))
                    })?
            })
            .await;

        if let Err(e) = result {
            warn!("cache SET {} failed: {}. Continuing.", key, e);
        }
    }

    /// Delete keys best-effort.
    pub async fn delete(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let op_timeout = self.op_timeout;
        let owned = keys.to_vec();
        let result = self
            .breaker
            .execute(async move {
                tokio::time::timeout(op_timeout, backend.del(&owned))
                    .await
                    .map_err(|_| CacheError::BackendUnavailable("DEL timed out".to_owned()))?
            })
            .await;

        if let Err(e) = result {
            warn!("cache DEL of {} keys failed: {}. Continuing.", keys.len(), e);
        }
    }

    /// Delete every key under the namespace matching `pattern` (glob).
    ///
    /// Runs KEYS then DEL; invalidation only, never on a latency-sensitive
    /// path. Returns the number of keys removed (0 on any backend error).
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        let full_pattern = self.namespaced(pattern);
        let backend = Arc::clone(&self.backend);
        let op_timeout = self.op_timeout;
        let owned = full_pattern.clone();
        let matched = self
            .breaker
            .execute(async move {
                tokio::time::timeout(op_timeout, backend.keys(&owned))
                    .await
                    .map_err(|_| {
                        CacheError::BackendUnavailable(format!("KEYS {} timed out", owned))
                    })?
            })
            .await;

        match matched {
            Ok(keys) if keys.is_empty() => 0,
            Ok(keys) => {
                let count = keys.len();
                self.delete(&keys).await;
                debug!("invalidated {} keys matching {}", count, full_pattern);
                count
            }
            Err(e) => {
                warn!("cache KEYS {} failed: {}. Continuing.", full_pattern, e);
                0
            }
        }
    }

    /// Whether a key exists. Errors read as absent.
    pub async fn exists(&self, key: &str) -> bool {
        let backend = Arc::clone(&self.backend);
        let op_timeout = self.op_timeout;
        let owned = key.to_owned();
        self.breaker
            .execute(async move {
                tokio::time::timeout(op_timeout, backend.exists(&owned))
                    .await
                    .map_err(|_| {
                        CacheError::BackendUnavailable(format!("EXISTS {} timed out", owned))
                    })?
            })
            .await
            .unwrap_or(false)
    }

    /// Remaining TTL for a key, `None` if missing or on error.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let backend = Arc::clone(&self.backend);
        let op_timeout = self.op_timeout;
        let owned = key.to_owned();
        self.breaker
            .execute(async move {
                tokio::time::timeout(op_timeout, backend.ttl(&owned))
                    .await
                    .map_err(|_| {
                        CacheError::BackendUnavailable(format!("TTL {} timed out", owned))
                    })?
            })
            .await
            .ok()
            .flatten()
    }

    /// Probe the backend and measure round-trip latency.
    ///
    /// Bypasses the breaker on purpose: the health endpoint reports the real
    /// backend state alongside the breaker's own snapshot.
    pub async fn ping(&self) -> Result<Duration, CacheError> {
        let start = Instant::now();
        tokio::time::timeout(self.op_timeout, self.backend.ping())
            .await
            .map_err(|_| CacheError::BackendUnavailable("PING timed out".to_owned()))??;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::BreakerConfig;
    use proptest::prelude::*;

    fn test_cache() -> KeyValueCache {
        let config = CacheConfig::default();
        KeyValueCache::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(CircuitBreaker::new("test", BreakerConfig::default())),
            &config,
        )
    }

    #[test]
    fn generate_key_sorts_params() {
        let cache = test_cache();
        let a = cache.generate_key("articles", &[("b", "2"), ("a", "1")]);
        let b = cache.generate_key("articles", &[("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a, "news:articles:a=1:b=2");
    }

    #[test]
    fn generate_key_without_params() {
        let cache = test_cache();
        assert_eq!(cache.generate_key("digest", &[]), "news:digest");
    }

    proptest! {
        #[test]
        fn generate_key_is_order_independent(
            mut params in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{1,8}"), 0..6)
        ) {
            let cache = test_cache();
            let pairs: Vec<(&str, &str)> =
                params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let original = cache.generate_key("base", &pairs);

            params.reverse();
            let reversed: Vec<(&str, &str)> =
                params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            prop_assert_eq!(original, cache.generate_key("base", &reversed));
        }
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let cache = test_cache();
        let key = cache.generate_key("articles", &[("page", "1")]);
        cache.set(&key, "payload", Duration::from_secs(60)).await;
        assert_eq!(cache.get(&key).await.as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn delete_pattern_clears_namespace_family() {
        let cache = test_cache();
        for page in ["1", "2", "3"] {
            let key = cache.generate_key("articles", &[("page", page)]);
            cache.set(&key, "x", Duration::from_secs(60)).await;
        }
        let other = cache.generate_key("digest", &[]);
        cache.set(&other, "y", Duration::from_secs(60)).await;

        assert_eq!(cache.delete_pattern("articles:*").await, 3);
        assert_eq!(
            cache.get(&cache.generate_key("articles", &[("page", "1")])).await,
            None
        );
        assert_eq!(cache.get(&other).await.as_deref(), Some("y"));
    }
}
