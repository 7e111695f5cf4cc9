//! Cache configuration
//!
//! Every tunable the adaptive layers depend on lives here with a documented
//! default; nothing in the hot paths hard-codes a threshold.

use std::time::Duration;

/// Top-level configuration for the caching core
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace prefixed onto every backend key (`"{namespace}:{base}..."`)
    pub namespace: String,
    /// Per-call timeout for every backend operation; a timeout counts as a
    /// circuit-breaker failure
    pub op_timeout: Duration,
    /// Backend latency above which the health endpoint reports degraded
    pub degraded_latency: Duration,
    /// Default fresh TTL for stale-while-revalidate entries
    pub fresh_ttl: Duration,
    /// Default stale TTL (total serve window) for SWR entries; entries past
    /// this are treated as absent
    pub stale_ttl: Duration,
    /// Circuit breaker settings for the backend
    pub breaker: BreakerConfig,
    /// Batch loader settings
    pub batch: BatchConfig,
    /// Memory optimizer settings
    pub memory: MemoryConfig,
    /// Maximum random jitter added to warm task schedules
    pub warm_jitter: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "news".to_owned(),
            op_timeout: Duration::from_secs(3),
            degraded_latency: Duration::from_millis(250),
            fresh_ttl: Duration::from_secs(60),
            stale_ttl: Duration::from_secs(300),
            breaker: BreakerConfig::default(),
            batch: BatchConfig::default(),
            memory: MemoryConfig::default(),
            warm_jitter: Duration::from_millis(500),
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that trip the breaker open
    pub failure_threshold: u32,
    /// Tracking window for consecutive failures
    pub failure_window: Duration,
    /// How long the breaker stays open before allowing trial calls
    pub reset_timeout: Duration,
    /// Maximum concurrent trial calls while half-open
    pub half_open_trial_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(30),
            half_open_trial_limit: 2,
        }
    }
}

/// Batch loader tuning
///
/// Adaptive sizing is bounded and gradual: multiplicative shrink when p95
/// flush latency overshoots the target, small additive growth only while
/// windows keep saturating at the current size.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Lower bound for the adaptive batch size
    pub min_batch_size: usize,
    /// Upper bound for the adaptive batch size
    pub max_batch_size: usize,
    /// Batch size a fresh loader starts at
    pub initial_batch_size: usize,
    /// How long a batch window stays open before flushing regardless of size
    pub flush_deadline: Duration,
    /// p95 flush latency the adaptive sizing steers toward
    pub latency_target: Duration,
    /// Multiplier applied when p95 exceeds the target (floored at min)
    pub shrink_factor: f64,
    /// Consecutive size-triggered flushes required before growing
    pub grow_after_saturated: u32,
    /// Capacity of the rolling flush-latency ring buffer
    pub latency_window: usize,
    /// TTL for L1 (in-process) relation entries
    pub l1_ttl: Duration,
    /// Maximum L1 entries per loader
    pub l1_max_capacity: u64,
    /// TTL for L2 (shared backend) relation entries
    pub l2_ttl: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 100,
            initial_batch_size: 25,
            flush_deadline: Duration::from_millis(2),
            latency_target: Duration::from_millis(50),
            shrink_factor: 0.75,
            grow_after_saturated: 3,
            latency_window: 128,
            l1_ttl: Duration::from_secs(5),
            l1_max_capacity: 10_000,
            l2_ttl: Duration::from_secs(60),
        }
    }
}

/// Memory pressure thresholds
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// How often the monitor samples process RSS
    pub sample_interval: Duration,
    /// RSS above this triggers a light optimization pass
    pub soft_limit_bytes: u64,
    /// RSS above this triggers an aggressive optimization pass
    pub hard_limit_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            soft_limit_bytes: 512 * 1024 * 1024,
            hard_limit_bytes: 1024 * 1024 * 1024,
        }
    }
}
