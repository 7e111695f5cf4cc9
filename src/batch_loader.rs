//! Adaptive batch loader for relational point lookups
//!
//! Collapses many "does (owner, entity) hold relation R" checks into bulk
//! queries against an injected [`BulkSource`], with two cache tiers in front:
//!
//! - L1: in-process Moka cache with a seconds-scale TTL.
//! - L2: the shared [`KeyValueCache`].
//!
//! Misses join the loader's current batch window. The window flushes when
//! its deduplicated pair count reaches the current batch size or when a
//! short deadline elapses, whichever comes first, and every waiter for a
//! pair observes the same result from that single bulk query.
//!
//! ## Adaptive sizing
//!
//! Flush latencies feed a fixed-size ring buffer owned by the loader. When
//! p95 exceeds the configured target the batch size shrinks
//! multiplicatively; when latency is comfortably under target and windows
//! keep filling to the current size, it grows additively. This bounds
//! worst-case per-flush latency while maximizing coalescing under light
//! load.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{BatchConfig, CacheError, KeyValueCache};

/// An (owner, entity) relation lookup key.
pub type RelationPair = (String, String);

/// Bulk data-source collaborator.
///
/// The loader has no knowledge of what it queries; implementations issue
/// one query per flush (e.g. `WHERE owner_id IN (...) AND entity_id IN (...)`
/// or the per-owner equivalent) and return the subset of pairs that hold.
#[async_trait]
pub trait BulkSource: Send + Sync + 'static {
    async fn fetch_batch(
        &self,
        pairs: &[RelationPair],
    ) -> Result<HashSet<RelationPair>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Per-loader counters and latency percentiles for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLoaderStats {
    pub name: String,
    pub total_requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub db_hits: u64,
    pub current_batch_size: usize,
    pub latency: LatencySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Administrative surface shared by all loaders regardless of their source
/// type; consumed by the memory optimizer and the metrics endpoint.
pub trait LoaderAdmin: Send + Sync + 'static {
    fn name(&self) -> &str;
    /// Drop every L1 entry.
    fn clear_l1(&self);
    /// Collapse the adaptive batch size back to its configured minimum.
    fn shrink_batch_size(&self);
    fn get_stats(&self) -> BatchLoaderStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    /// Queued pair count reached the current batch size
    Size,
    /// The window deadline elapsed first
    Deadline,
}

type Waiter = oneshot::Sender<Result<bool, String>>;

struct BatchWindow {
    generation: u64,
    opened_at: Instant,
    /// One slot per deduplicated pair; every waiter for a pair resolves from
    /// the same flush result.
    waiters: HashMap<RelationPair, Vec<Waiter>>,
}

/// Fixed-capacity ring of flush latency samples (milliseconds).
pub(crate) struct LatencyRing {
    samples: Vec<u64>,
    capacity: usize,
    next: usize,
}

impl LatencyRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            next: 0,
        }
    }

    pub(crate) fn push(&mut self, value: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            self.samples[self.next] = value;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn percentile(&self, q: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() - 1) as f64 * q).round() as usize;
        Some(sorted[index])
    }
}

/// Minimum latency samples before adaptive sizing reacts.
const MIN_ADAPT_SAMPLES: usize = 8;

struct LoaderCounters {
    total_requests: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    db_hits: AtomicU64,
}

struct LoaderInner<S: BulkSource> {
    name: String,
    source: S,
    kv: Arc<KeyValueCache>,
    config: BatchConfig,
    l1: moka::future::Cache<RelationPair, bool>,
    window: Mutex<Option<BatchWindow>>,
    generation: AtomicU64,
    batch_size: AtomicUsize,
    saturated_flushes: AtomicU32,
    latencies: Mutex<LatencyRing>,
    counters: LoaderCounters,
}

/// Coalescing two-tier loader. Cheap to clone; clones share all state.
pub struct BatchLoader<S: BulkSource> {
    inner: Arc<LoaderInner<S>>,
}

impl<S: BulkSource> Clone for BatchLoader<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: BulkSource> BatchLoader<S> {
    /// `name` identifies the relation; it becomes the L2 key base and the
    /// loader's label on the metrics endpoint.
    pub fn new(name: impl Into<String>, source: S, kv: Arc<KeyValueCache>, config: BatchConfig) -> Self {
        let l1 = moka::future::Cache::builder()
            .max_capacity(config.l1_max_capacity)
            .time_to_live(config.l1_ttl)
            .build();
        let initial = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        let latency_window = config.latency_window;
        Self {
            inner: Arc::new(LoaderInner {
                name: name.into(),
                source,
                kv,
                config,
                l1,
                window: Mutex::new(None),
                generation: AtomicU64::new(0),
                batch_size: AtomicUsize::new(initial),
                saturated_flushes: AtomicU32::new(0),
                latencies: Mutex::new(LatencyRing::new(latency_window)),
                counters: LoaderCounters {
                    total_requests: AtomicU64::new(0),
                    l1_hits: AtomicU64::new(0),
                    l2_hits: AtomicU64::new(0),
                    db_hits: AtomicU64::new(0),
                },
            }),
        }
    }

    /// Whether `owner` holds the relation to `entity`.
    ///
    /// Serves from L1/L2 when possible; otherwise suspends until the current
    /// batch window flushes. Repeated identical pairs inside one window share
    /// a single waiter slot and observe the same result.
    pub async fn load(&self, owner_id: &str, entity_id: &str) -> Result<bool, CacheError> {
        let inner = &self.inner;
        inner.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let pair: RelationPair = (owner_id.to_owned(), entity_id.to_owned());

        if let Some(held) = inner.l1.get(&pair).await {
            inner.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(held);
        }

        let l2_key = inner.l2_key(owner_id, entity_id);
        if let Some(raw) = inner.kv.get(&l2_key).await {
            match serde_json::from_str::<bool>(&raw) {
                Ok(held) => {
                    inner.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                    inner.l1.insert(pair, held).await;
                    return Ok(held);
                }
                Err(e) => {
                    debug!("unreadable L2 relation entry {}: {}", l2_key, e);
                }
            }
        }

        let rx = Arc::clone(inner).enqueue(pair);
        match rx.await {
            Ok(Ok(held)) => Ok(held),
            Ok(Err(message)) => Err(CacheError::Fetcher(message)),
            Err(_) => Err(CacheError::Fetcher(
                "batch window was dropped before flushing".to_owned(),
            )),
        }
    }

    /// Point invalidation, e.g. after the owner toggles the relation.
    pub async fn invalidate(&self, owner_id: &str, entity_id: &str) {
        let pair: RelationPair = (owner_id.to_owned(), entity_id.to_owned());
        self.inner.l1.invalidate(&pair).await;
        self.inner
            .kv
            .delete(&[self.inner.l2_key(owner_id, entity_id)])
            .await;
    }

    /// Flush whatever is queued right now without waiting for the deadline.
    /// Test and shutdown aid.
    pub async fn flush_now(&self) {
        let window = {
            let mut slot = self.inner.window_lock();
            slot.take()
        };
        if let Some(window) = window {
            self.inner.flush(window, FlushTrigger::Deadline).await;
        }
    }
}

impl<S: BulkSource> LoaderInner<S> {
    fn window_lock(&self) -> MutexGuard<'_, Option<BatchWindow>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latencies_lock(&self) -> MutexGuard<'_, LatencyRing> {
        self.latencies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn l2_key(&self, owner_id: &str, entity_id: &str) -> String {
        self.kv
            .generate_key(&self.name, &[("owner", owner_id), ("entity", entity_id)])
    }

    fn enqueue(self: Arc<Self>, pair: RelationPair) -> oneshot::Receiver<Result<bool, String>> {
        let (tx, rx) = oneshot::channel();
        let mut full_window = None;
        {
            let mut slot = self.window_lock();
            let window = slot.get_or_insert_with(|| {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let inner = Arc::clone(&self);
                let deadline = self.config.flush_deadline;
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    inner.flush_generation(generation).await;
                });
                BatchWindow {
                    generation,
                    opened_at: Instant::now(),
                    waiters: HashMap::new(),
                }
            });
            window.waiters.entry(pair).or_default().push(tx);
            if window.waiters.len() >= self.batch_size.load(Ordering::Relaxed) {
                full_window = slot.take();
            }
        }
        if let Some(window) = full_window {
            tokio::spawn(async move {
                self.flush(window, FlushTrigger::Size).await;
            });
        }
        rx
    }

    /// Deadline path: flush only if the window that armed this timer is
    /// still current (a size-triggered flush may have beaten it).
    async fn flush_generation(self: Arc<Self>, generation: u64) {
        let window = {
            let mut slot = self.window_lock();
            if slot.as_ref().map(|w| w.generation) == Some(generation) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(window) = window {
            self.flush(window, FlushTrigger::Deadline).await;
        }
    }

    async fn flush(&self, window: BatchWindow, trigger: FlushTrigger) {
        let pairs: Vec<RelationPair> = window.waiters.keys().cloned().collect();
        debug!(
            "loader {}: flushing {} pairs ({:?}-triggered, window open {:?})",
            self.name,
            pairs.len(),
            trigger,
            window.opened_at.elapsed()
        );

        let start = Instant::now();
        let result = self.source.fetch_batch(&pairs).await;
        let elapsed = start.elapsed();

        match result {
            Ok(held) => {
                self.counters
                    .db_hits
                    .fetch_add(pairs.len() as u64, Ordering::Relaxed);
                for (pair, waiters) in window.waiters {
                    let value = held.contains(&pair);
                    for tx in waiters {
                        let _ = tx.send(Ok(value));
                    }
                    let l2_key = self.l2_key(&pair.0, &pair.1);
                    self.l1.insert(pair, value).await;
                    self.kv
                        .set(&l2_key, if value { "true" } else { "false" }, self.config.l2_ttl)
                        .await;
                }
            }
            Err(e) => {
                warn!(
                    "loader {}: bulk fetch of {} pairs failed: {}",
                    self.name,
                    pairs.len(),
                    e
                );
                let message = e.to_string();
                for (_, waiters) in window.waiters {
                    for tx in waiters {
                        let _ = tx.send(Err(message.clone()));
                    }
                }
            }
        }

        self.record_flush(elapsed, trigger);
    }

    fn record_flush(&self, elapsed: Duration, trigger: FlushTrigger) {
        let elapsed_ms = elapsed.as_millis() as u64;
        let (p95, sample_count) = {
            let mut ring = self.latencies_lock();
            ring.push(elapsed_ms);
            (ring.percentile(0.95), ring.len())
        };

        match trigger {
            FlushTrigger::Size => {
                self.saturated_flushes.fetch_add(1, Ordering::Relaxed);
            }
            FlushTrigger::Deadline => {
                self.saturated_flushes.store(0, Ordering::Relaxed);
            }
        }

        if sample_count < MIN_ADAPT_SAMPLES {
            return;
        }
        let Some(p95) = p95 else { return };

        let current = self.batch_size.load(Ordering::Relaxed);
        let target_ms = self.config.latency_target.as_millis() as u64;
        if p95 > target_ms {
            let shrunk = ((current as f64 * self.config.shrink_factor) as usize)
                .max(self.config.min_batch_size);
            if shrunk < current {
                self.batch_size.store(shrunk, Ordering::Relaxed);
                self.saturated_flushes.store(0, Ordering::Relaxed);
                debug!(
                    "loader {}: p95 {}ms over {}ms target, batch size {} -> {}",
                    self.name, p95, target_ms, current, shrunk
                );
            }
        } else if p95.saturating_mul(2) <= target_ms
            && self.saturated_flushes.load(Ordering::Relaxed) >= self.config.grow_after_saturated
        {
            let grown = (current + (current / 10).max(1)).min(self.config.max_batch_size);
            if grown > current {
                self.batch_size.store(grown, Ordering::Relaxed);
                self.saturated_flushes.store(0, Ordering::Relaxed);
                debug!(
                    "loader {}: windows saturating under target latency, batch size {} -> {}",
                    self.name, current, grown
                );
            }
        }
    }

    fn stats(&self) -> BatchLoaderStats {
        let (p50, p95, p99) = {
            let ring = self.latencies_lock();
            (
                ring.percentile(0.50).unwrap_or(0),
                ring.percentile(0.95).unwrap_or(0),
                ring.percentile(0.99).unwrap_or(0),
            )
        };
        BatchLoaderStats {
            name: self.name.clone(),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            db_hits: self.counters.db_hits.load(Ordering::Relaxed),
            current_batch_size: self.batch_size.load(Ordering::Relaxed),
            latency: LatencySummary { p50, p95, p99 },
        }
    }
}

impl<S: BulkSource> LoaderAdmin for BatchLoader<S> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn clear_l1(&self) {
        self.inner.l1.invalidate_all();
    }

    fn shrink_batch_size(&self) {
        self.inner
            .batch_size
            .store(self.inner.config.min_batch_size, Ordering::Relaxed);
        self.inner.saturated_flushes.store(0, Ordering::Relaxed);
    }

    fn get_stats(&self) -> BatchLoaderStats {
        self.inner.stats()
    }
}
