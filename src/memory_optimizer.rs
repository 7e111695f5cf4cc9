//! Memory-pressure controller
//!
//! Samples process RSS on a fixed interval and reacts to pressure by
//! trimming in-process cache state:
//!
//! - Soft threshold: light pass — clear every batch loader's L1 tier and
//!   collapse their batch sizes back to the configured minimum.
//! - Hard threshold (or `optimize_manual(true)`): aggressive pass — the
//!   light pass plus purging the layered cache's in-flight bookkeeping.
//!   Rust has no forced garbage collection to request, so the aggressive
//!   pass ends at dropping in-process state.
//!
//! All passes are idempotent and safe to run without pressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch_loader::LoaderAdmin;
use crate::{LayeredCache, MemoryConfig};

/// Status snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    pub memory_usage_bytes: u64,
    pub monitoring_active: bool,
    pub last_optimization_at_ms: Option<u64>,
}

/// RSS sampler that keeps the `sysinfo` handle and pid between samples,
/// refreshing only this process's memory stats.
struct MemorySampler {
    system: System,
    pid: Option<Pid>,
}

impl MemorySampler {
    fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("could not resolve own pid for memory sampling: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    fn rss_bytes(&mut self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

type LoaderList = Arc<RwLock<Vec<Arc<dyn LoaderAdmin>>>>;

struct OptimizerInner {
    config: MemoryConfig,
    layered: LayeredCache,
    loaders: LoaderList,
    sampler: Mutex<MemorySampler>,
    monitoring: AtomicBool,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    last_optimization_at: Mutex<Option<SystemTime>>,
}

/// Process-level eviction controller. Cheap to clone; clones share all
/// state.
#[derive(Clone)]
pub struct MemoryOptimizer {
    inner: Arc<OptimizerInner>,
}

impl MemoryOptimizer {
    /// `loaders` is the shared loader registry; loaders registered after
    /// construction are picked up automatically.
    pub fn new(config: MemoryConfig, layered: LayeredCache, loaders: LoaderList) -> Self {
        Self {
            inner: Arc::new(OptimizerInner {
                config,
                layered,
                loaders,
                sampler: Mutex::new(MemorySampler::new()),
                monitoring: AtomicBool::new(false),
                monitor_handle: Mutex::new(None),
                last_optimization_at: Mutex::new(None),
            }),
        }
    }

    /// Start the sampling loop. Idempotent.
    pub fn start_monitoring(&self) {
        if self.inner.monitoring.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "memory monitoring started (soft {} MiB, hard {} MiB)",
            self.inner.config.soft_limit_bytes / (1024 * 1024),
            self.inner.config.hard_limit_bytes / (1024 * 1024)
        );
        let optimizer = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(optimizer.inner.config.sample_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let rss = optimizer.sample_rss();
                if rss >= optimizer.inner.config.hard_limit_bytes {
                    warn!("hard memory limit crossed at {} bytes RSS", rss);
                    optimizer.run_pass(true).await;
                } else if rss >= optimizer.inner.config.soft_limit_bytes {
                    info!("soft memory limit crossed at {} bytes RSS", rss);
                    optimizer.run_pass(false).await;
                }
            }
        });
        *lock(&self.inner.monitor_handle) = Some(handle);
    }

    /// Stop the sampling loop. Idempotent.
    pub fn stop_monitoring(&self) {
        if !self.inner.monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = lock(&self.inner.monitor_handle).take() {
            handle.abort();
        }
        info!("memory monitoring stopped");
    }

    /// Run an optimization pass immediately, regardless of pressure.
    pub async fn optimize_manual(&self, aggressive: bool) {
        self.run_pass(aggressive).await;
    }

    pub fn get_status(&self) -> MemoryStatus {
        let last_optimization_at = *lock(&self.inner.last_optimization_at);
        MemoryStatus {
            memory_usage_bytes: self.sample_rss(),
            monitoring_active: self.inner.monitoring.load(Ordering::SeqCst),
            last_optimization_at_ms: last_optimization_at.map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            }),
        }
    }

    fn sample_rss(&self) -> u64 {
        lock(&self.inner.sampler).rss_bytes()
    }

    async fn run_pass(&self, aggressive: bool) {
        let loaders: Vec<Arc<dyn LoaderAdmin>> = {
            let loaders = self
                .inner
                .loaders
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            loaders.clone()
        };
        for loader in &loaders {
            loader.clear_l1();
            loader.shrink_batch_size();
            debug!("cleared L1 and shrank batch size for loader {}", loader.name());
        }
        if aggressive {
            self.inner.layered.clear_in_flight().await;
        }
        *lock(&self.inner.last_optimization_at) = Some(SystemTime::now());
        info!(
            "memory optimization pass complete ({} loaders, aggressive={})",
            loaders.len(),
            aggressive
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
