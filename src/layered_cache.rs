//! Stale-while-revalidate get-or-fetch cache
//!
//! Built on [`KeyValueCache`]; adds the SWR window and thundering-herd
//! protection:
//!
//! - Fresh entry: returned as a HIT.
//! - Stale entry (past the fresh TTL, inside the stale TTL): returned
//!   immediately as STALE while a detached background task refreshes the
//!   entry, unless a refresh for that key is already in flight. The caller
//!   never waits on the refresh.
//! - Absent, unreadable, or breaker-open: single-flight. Concurrent callers
//!   for the same key share one fetcher invocation and all observe its
//!   result; the winner runs the fetcher synchronously and writes back
//!   best-effort.
//!
//! An entry past its stale TTL is never trusted; it reads as absent.
//!
//! The in-flight map shares the *serialized* payload between waiters so that
//! `get_or_fetch` can stay generic per call site; each waiter deserializes
//! into its own value type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

use crate::backend::glob_match;
use crate::{CacheConfig, CacheError, KeyValueCache};

/// How a lookup was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

/// A resolved lookup: the value plus how it was obtained.
#[derive(Debug)]
pub struct CacheLookup<T> {
    pub value: Arc<T>,
    pub status: CacheStatus,
}

/// Fresh/stale TTL pair for one entry.
#[derive(Debug, Clone, Copy)]
pub struct SwrOptions {
    /// Window in which the entry is served as a HIT
    pub fresh_ttl: Duration,
    /// Total window in which the entry may be served at all; past this the
    /// entry is treated as absent
    pub stale_ttl: Duration,
}

impl SwrOptions {
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        Self { fresh_ttl, stale_ttl }
    }
}

/// Stored representation: payload JSON plus the SWR window bounds.
#[derive(Serialize, Deserialize)]
struct Envelope {
    payload: String,
    created_at_ms: u64,
    fresh_until_ms: u64,
    stale_until_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared result of an in-flight fetch: serialized payload on success,
/// error message on failure.
type InFlightResult = Option<Result<String, String>>;
type InFlightFetch = watch::Receiver<InFlightResult>;
type InFlightSender = watch::Sender<InFlightResult>;
type InFlightMap = Arc<RwLock<HashMap<String, InFlightFetch>>>;

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped, removes the key from the in-flight map and notifies waiters
/// with an error if no result was sent.
struct InFlightGuard {
    key: String,
    in_flight: InFlightMap,
    tx: Option<InFlightSender>,
}

impl InFlightGuard {
    fn new(key: String, in_flight: InFlightMap, tx: InFlightSender) -> Self {
        Self {
            key,
            in_flight,
            tx: Some(tx),
        }
    }

    /// Complete the fetch with a result, consuming the guard.
    fn complete(mut self, result: Result<String, String>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // If tx is still Some we are being dropped without complete(),
        // meaning the producing call panicked or was cancelled.
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err("fetch was cancelled or panicked".to_owned())));
        }

        let key = std::mem::take(&mut self.key);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let mut guard = in_flight.write().await;
            guard.remove(&key);
        });
    }
}

/// Layered get-or-fetch cache with SWR semantics and single-flight
/// deduplication. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct LayeredCache {
    kv: Arc<KeyValueCache>,
    in_flight: InFlightMap,
    defaults: SwrOptions,
}

impl LayeredCache {
    pub fn new(kv: Arc<KeyValueCache>, config: &CacheConfig) -> Self {
        Self {
            kv,
            in_flight: Arc::new(RwLock::new(HashMap::new())),
            defaults: SwrOptions::new(config.fresh_ttl, config.stale_ttl),
        }
    }

    /// The default fresh/stale split from configuration.
    pub fn default_options(&self) -> SwrOptions {
        self.defaults
    }

    /// The underlying key-value layer (for key generation).
    pub fn kv(&self) -> &KeyValueCache {
        &self.kv
    }

    /// Look up `key`, falling back to `fetcher` per the SWR algorithm.
    ///
    /// `key` is expected to come from [`KeyValueCache::generate_key`] and to
    /// always carry the same logical value type: callers joining an
    /// in-flight fetch decode the shared result, and a type mismatch
    /// surfaces as a `Fetcher` error. At most one concurrent fetcher
    /// invocation runs per key regardless of the number of simultaneous
    /// callers; only fetcher errors propagate.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        opts: SwrOptions,
    ) -> Result<CacheLookup<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Box<dyn std::error::Error + Send + Sync>>> + Send + 'static,
    {
        if let Some(raw) = self.kv.get(key).await {
            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => {
                    let now = now_ms();
                    if now < envelope.fresh_until_ms {
                        match serde_json::from_str::<T>(&envelope.payload) {
                            Ok(value) => {
                                debug!("cache hit for key: {}", key);
                                return Ok(CacheLookup {
                                    value: Arc::new(value),
                                    status: CacheStatus::Hit,
                                });
                            }
                            Err(e) => self.discard_corrupt(key, &e).await,
                        }
                    } else if now < envelope.stale_until_ms {
                        match serde_json::from_str::<T>(&envelope.payload) {
                            Ok(value) => {
                                debug!("serving stale value for key: {}", key);
                                self.spawn_refresh(key, fetcher, opts);
                                return Ok(CacheLookup {
                                    value: Arc::new(value),
                                    status: CacheStatus::Stale,
                                });
                            }
                            Err(e) => self.discard_corrupt(key, &e).await,
                        }
                    } else {
                        debug!("entry for key {} past its stale window; treating as absent", key);
                    }
                }
                Err(e) => self.discard_corrupt(key, &e).await,
            }
        }

        self.fetch_single_flight(key, fetcher, opts).await
    }

    /// Write an entry directly, stamping its SWR window. Used by warm tasks
    /// and write-through call sites.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        opts: SwrOptions,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        self.write_envelope(key, &payload, opts).await;
        Ok(())
    }

    /// Invalidate every cached entry matching `pattern` (glob, relative to
    /// the namespace) and purge matching in-flight markers so the next call
    /// is a clean miss rather than a joined refresh. Returns the number of
    /// backend keys removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let removed = self.kv.delete_pattern(pattern).await;
        let full_pattern = self.kv.namespaced(pattern);
        let mut in_flight = self.in_flight.write().await;
        in_flight.retain(|key, _| !glob_match(&full_pattern, key));
        removed
    }

    /// Drop all in-flight bookkeeping. Producing tasks finish on their own
    /// and their guard removals become no-ops. Used by the memory optimizer.
    pub async fn clear_in_flight(&self) {
        let mut in_flight = self.in_flight.write().await;
        in_flight.clear();
    }

    async fn discard_corrupt(&self, key: &str, error: &serde_json::Error) {
        warn!(
            "unreadable cache entry for key {}: {}. Deleting and refetching.",
            key, error
        );
        self.kv.delete(&[key.to_owned()]).await;
    }

    async fn write_envelope(&self, key: &str, payload: &str, opts: SwrOptions) {
        let now = now_ms();
        let envelope = Envelope {
            payload: payload.to_owned(),
            created_at_ms: now,
            fresh_until_ms: now + opts.fresh_ttl.as_millis() as u64,
            stale_until_ms: now + opts.stale_ttl.as_millis() as u64,
        };
        match serde_json::to_string(&envelope) {
            // The backend entry lives exactly as long as it may be served
            Ok(raw) => self.kv.set(key, &raw, opts.stale_ttl).await,
            Err(e) => warn!("failed to encode cache envelope for key {}: {}", key, e),
        }
    }

    /// Detached refresh behind a stale read. Skipped when a refresh for this
    /// key is already in flight; its failure is logged, never propagated.
    fn spawn_refresh<T, F, Fut>(&self, key: &str, fetcher: F, opts: SwrOptions)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Box<dyn std::error::Error + Send + Sync>>> + Send + 'static,
    {
        let key = key.to_owned();
        let cache = self.clone();
        tokio::spawn(async move {
            let (tx, rx) = watch::channel(None);
            let guard = {
                let mut in_flight = cache.in_flight.write().await;
                if in_flight.contains_key(&key) {
                    debug!("refresh already in flight for key: {}", key);
                    return;
                }
                in_flight.insert(key.clone(), rx);
                InFlightGuard::new(key.clone(), Arc::clone(&cache.in_flight), tx)
            };

            match fetcher().await {
                Ok(value) => match serde_json::to_string(&value) {
                    Ok(payload) => {
                        cache.write_envelope(&key, &payload, opts).await;
                        guard.complete(Ok(payload));
                        debug!("background refresh complete for key: {}", key);
                    }
                    Err(e) => {
                        warn!("background refresh for key {} produced unserializable value: {}", key, e);
                        guard.complete(Err(e.to_string()));
                    }
                },
                Err(e) => {
                    warn!("background refresh failed for key {}: {}", key, e);
                    guard.complete(Err(e.to_string()));
                }
            }
        });
    }

    async fn fetch_single_flight<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        opts: SwrOptions,
    ) -> Result<CacheLookup<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Box<dyn std::error::Error + Send + Sync>>> + Send + 'static,
    {
        // Join an existing fetch if one is running
        {
            let in_flight = self.in_flight.read().await;
            if let Some(rx) = in_flight.get(key) {
                let rx = rx.clone();
                drop(in_flight);
                debug!("waiting for in-flight fetch for key: {}", key);
                return await_in_flight(rx).await;
            }
        }

        let (tx, rx) = watch::channel(None);
        let guard = {
            let mut in_flight = self.in_flight.write().await;
            // Another task may have registered while we waited for the lock
            if let Some(existing) = in_flight.get(key) {
                let rx = existing.clone();
                drop(in_flight);
                debug!("waiting for in-flight fetch for key (race): {}", key);
                return await_in_flight(rx).await;
            }
            in_flight.insert(key.to_owned(), rx);
            InFlightGuard::new(key.to_owned(), Arc::clone(&self.in_flight), tx)
        };

        match fetcher().await {
            Ok(value) => {
                let payload = match serde_json::to_string(&value) {
                    Ok(p) => p,
                    Err(e) => {
                        guard.complete(Err(e.to_string()));
                        return Err(CacheError::Serialization(e));
                    }
                };
                self.write_envelope(key, &payload, opts).await;
                guard.complete(Ok(payload));
                Ok(CacheLookup {
                    value: Arc::new(value),
                    status: CacheStatus::Miss,
                })
            }
            Err(e) => {
                let message = e.to_string();
                guard.complete(Err(message.clone()));
                Err(CacheError::Fetcher(message))
            }
        }
    }
}

/// Wait on a shared in-flight fetch and deserialize its payload.
async fn await_in_flight<T: DeserializeOwned>(
    mut rx: InFlightFetch,
) -> Result<CacheLookup<T>, CacheError> {
    loop {
        {
            let current = rx.borrow();
            if let Some(result) = current.as_ref() {
                return match result {
                    Ok(payload) => match serde_json::from_str::<T>(payload) {
                        Ok(value) => Ok(CacheLookup {
                            value: Arc::new(value),
                            status: CacheStatus::Miss,
                        }),
                        // The producer fetched under a different value type
                        Err(e) => Err(CacheError::Fetcher(format!(
                            "shared fetch result does not decode as the requested type: {}",
                            e
                        ))),
                    },
                    Err(message) => Err(CacheError::Fetcher(message.clone())),
                };
            }
        }
        if rx.changed().await.is_err() {
            // Sender dropped without sending
            return Err(CacheError::Fetcher("in-flight fetch was cancelled".to_owned()));
        }
    }
}
