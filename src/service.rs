//! Cache service composition root
//!
//! One `CacheService` is constructed at process start and handed to request
//! handlers by dependency injection; there is no global singleton. It wires
//! backend → circuit breaker → key-value layer → layered cache, owns the
//! warmer and memory optimizer controllers, and serves the operator admin
//! surface. `shutdown` cancels the background controllers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::{error, info};

use crate::backend::CacheBackend;
use crate::batch_loader::{BatchLoaderStats, LoaderAdmin};
use crate::{
    BreakerState, BreakerStats, CacheConfig, CacheError, CacheWarmer, CircuitBreaker,
    KeyValueCache, LayeredCache, MemoryOptimizer,
};

/// Aggregate health for `GET /cache/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub redis: RedisHealth,
    pub circuit_breaker: BreakerStats,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisHealth {
    pub connected: bool,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

/// Per-loader stats plus an aggregate hit-rate summary for
/// `GET /metrics/batch-optimizer`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub loaders: Vec<BatchLoaderStats>,
    pub summary: MetricsSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub db_hits: u64,
    pub cache_hit_rate: f64,
}

/// The caching core, assembled once at startup.
pub struct CacheService {
    config: CacheConfig,
    breaker: Arc<CircuitBreaker>,
    kv: Arc<KeyValueCache>,
    layered: LayeredCache,
    warmer: CacheWarmer,
    optimizer: MemoryOptimizer,
    loaders: Arc<RwLock<Vec<Arc<dyn LoaderAdmin>>>>,
    admin_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheService {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new("cache-backend", config.breaker.clone()));
        let kv = Arc::new(KeyValueCache::new(backend, Arc::clone(&breaker), &config));
        let layered = LayeredCache::new(Arc::clone(&kv), &config);
        let loaders: Arc<RwLock<Vec<Arc<dyn LoaderAdmin>>>> = Arc::new(RwLock::new(Vec::new()));
        let warmer = CacheWarmer::new(config.warm_jitter);
        let optimizer =
            MemoryOptimizer::new(config.memory.clone(), layered.clone(), Arc::clone(&loaders));
        Self {
            config,
            breaker,
            kv,
            layered,
            warmer,
            optimizer,
            loaders,
            admin_handle: Mutex::new(None),
        }
    }

    /// Connect the production Redis backend and assemble the service.
    pub async fn connect(redis_url: &str, config: CacheConfig) -> Result<Self, CacheError> {
        let backend = crate::backend::RedisBackend::connect(redis_url).await?;
        info!("cache service connected to backend at {}", redis_url);
        Ok(Self::new(Arc::new(backend), config))
    }

    pub fn kv(&self) -> &Arc<KeyValueCache> {
        &self.kv
    }

    pub fn layered(&self) -> &LayeredCache {
        &self.layered
    }

    pub fn warmer(&self) -> &CacheWarmer {
        &self.warmer
    }

    pub fn optimizer(&self) -> &MemoryOptimizer {
        &self.optimizer
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Make a loader visible to the metrics endpoint and the memory
    /// optimizer.
    pub fn register_loader(&self, loader: Arc<dyn LoaderAdmin>) {
        let mut loaders = self.loaders.write().unwrap_or_else(PoisonError::into_inner);
        loaders.push(loader);
    }

    /// Serve the admin surface on `addr` until shutdown.
    pub fn start_admin(self: &Arc<Self>, addr: SocketAddr) {
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = crate::admin::run_admin_server(addr, service).await {
                error!("admin server error: {}", e);
            }
        });
        let mut slot = self
            .admin_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(handle);
    }

    /// Probe the backend and combine it with the breaker snapshot.
    ///
    /// A sustained-open breaker reports as degraded, not fatal: requests
    /// keep being served from fetchers. The error status is reserved for an
    /// unreachable backend that the breaker has not shielded yet, when
    /// callers are still paying full timeouts.
    pub async fn health_check(&self) -> HealthReport {
        let breaker = self.breaker.get_stats();
        let mut recommendations = Vec::new();

        let (connected, response_time_ms, backend_error) = match self.kv.ping().await {
            Ok(latency) => {
                if latency > self.config.degraded_latency {
                    recommendations.push(format!(
                        "backend responding slowly ({}ms round-trip); check backend load",
                        latency.as_millis()
                    ));
                }
                (true, Some(latency.as_millis() as u64), None)
            }
            Err(e) => (false, None, Some(e.to_string())),
        };

        let slow = connected && !recommendations.is_empty();
        let status = match (connected, breaker.state) {
            (true, BreakerState::Closed) if !slow => HealthStatus::Healthy,
            (true, BreakerState::Closed) => HealthStatus::Degraded,
            (true, _) => {
                recommendations.push(
                    "circuit breaker is not closed; cached reads fall back to fetchers until it recovers"
                        .to_owned(),
                );
                HealthStatus::Degraded
            }
            (false, BreakerState::Closed) => {
                recommendations.push(
                    "backend unreachable and circuit breaker has not opened yet; expect elevated latencies"
                        .to_owned(),
                );
                HealthStatus::Error
            }
            (false, _) => {
                recommendations.push(
                    "backend unreachable; circuit breaker is shielding callers".to_owned(),
                );
                HealthStatus::Degraded
            }
        };

        HealthReport {
            status,
            redis: RedisHealth {
                connected,
                response_time_ms,
                error: backend_error,
            },
            circuit_breaker: breaker,
            recommendations,
        }
    }

    /// Per-loader stats plus the aggregate hit-rate summary.
    pub fn loader_metrics(&self) -> MetricsReport {
        let stats: Vec<BatchLoaderStats> = {
            let loaders = self.loaders.read().unwrap_or_else(PoisonError::into_inner);
            loaders.iter().map(|l| l.get_stats()).collect()
        };
        let total_requests: u64 = stats.iter().map(|s| s.total_requests).sum();
        let cache_hits: u64 = stats.iter().map(|s| s.l1_hits + s.l2_hits).sum();
        let db_hits: u64 = stats.iter().map(|s| s.db_hits).sum();
        let cache_hit_rate = if total_requests > 0 {
            cache_hits as f64 / total_requests as f64
        } else {
            0.0
        };
        MetricsReport {
            loaders: stats,
            summary: MetricsSummary {
                total_requests,
                cache_hits,
                db_hits,
                cache_hit_rate,
            },
        }
    }

    /// Stop background controllers and the admin listener. In-flight
    /// background refreshes finish on their own; losing one is only a cache
    /// write lost.
    pub async fn shutdown(&self) {
        self.warmer.stop_periodic_warming();
        self.optimizer.stop_monitoring();
        let handle = {
            let mut slot = self
                .admin_handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.layered.clear_in_flight().await;
        info!("cache service shut down");
    }
}
