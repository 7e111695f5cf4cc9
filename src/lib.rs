//! newscache - resilient caching and batch-loading core
//!
//! The layer between request handlers and the primary store / external
//! fetchers of the news aggregation service:
//! - Namespaced key-value caching over a shared backend (Redis in
//!   production), with deterministic key generation
//! - A circuit breaker around every backend call
//! - Stale-while-revalidate get-or-fetch with single-flight deduplication
//! - Adaptive batch loaders that coalesce relational point lookups into
//!   bulk queries, with L1 (in-process) and L2 (shared) tiers
//! - Background cache warming and memory-pressure eviction controllers
//! - An operator admin surface (health, metrics, control actions)
//!
//! Cache failures degrade, never fail: backend outages fall back to the
//! injected fetchers, and only fetcher errors reach callers.

mod admin;
pub mod backend;
mod batch_loader;
mod cache_warmer;
mod circuit_breaker;
mod config;
mod error;
mod favorite_loader;
mod key_value_cache;
mod layered_cache;
mod memory_optimizer;
mod service;

pub use backend::{CacheBackend, MemoryBackend, RedisBackend};
pub use batch_loader::{
    BatchLoader, BatchLoaderStats, BulkSource, LatencySummary, LoaderAdmin, RelationPair,
};
pub use cache_warmer::{CacheWarmer, WarmFetcher, WarmTaskStatus};
pub use circuit_breaker::{BreakerState, BreakerStats, CircuitBreaker};
pub use config::{BatchConfig, BreakerConfig, CacheConfig, MemoryConfig};
pub use error::CacheError;
pub use favorite_loader::{FavoriteLoader, FavoriteSource};
pub use key_value_cache::KeyValueCache;
pub use layered_cache::{CacheLookup, CacheStatus, LayeredCache, SwrOptions};
pub use memory_optimizer::{MemoryOptimizer, MemoryStatus};
pub use service::{
    CacheService, HealthReport, HealthStatus, MetricsReport, MetricsSummary, RedisHealth,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
