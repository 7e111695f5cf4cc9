//! Scheduled cache warming
//!
//! Registered warm tasks pre-populate cache entries (front page, digests,
//! source lists) on their own intervals. Each schedule carries a small
//! random jitter so tasks registered together do not hit the backend in
//! synchronized bursts. Tasks are isolated: one fetcher failing is logged
//! and recorded on that task's status without affecting the others.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A unit of warming work, typically a closure over [`crate::LayeredCache::put`].
#[async_trait]
pub trait WarmFetcher: Send + Sync + 'static {
    async fn warm(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Default)]
struct TaskTimes {
    last_run_at: Option<SystemTime>,
    last_success_at: Option<SystemTime>,
    last_error: Option<String>,
    next_scheduled_at: Option<SystemTime>,
}

/// Per-task status for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmTaskStatus {
    pub name: String,
    pub interval_ms: u64,
    pub last_run_at_ms: Option<u64>,
    pub last_success_at_ms: Option<u64>,
    pub last_error: Option<String>,
    pub next_scheduled_at_ms: Option<u64>,
}

struct WarmTask {
    name: String,
    fetcher: Arc<dyn WarmFetcher>,
    interval: Duration,
    times: Mutex<TaskTimes>,
}

impl WarmTask {
    fn times_lock(&self) -> MutexGuard<'_, TaskTimes> {
        self.times.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_once(&self) {
        self.times_lock().last_run_at = Some(SystemTime::now());
        match self.fetcher.warm().await {
            Ok(()) => {
                let mut times = self.times_lock();
                times.last_success_at = Some(SystemTime::now());
                times.last_error = None;
                debug!("warm task {} completed", self.name);
            }
            Err(e) => {
                warn!("warm task {} failed: {}", self.name, e);
                self.times_lock().last_error = Some(e.to_string());
            }
        }
    }
}

struct WarmerInner {
    tasks: RwLock<Vec<Arc<WarmTask>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    max_jitter: Duration,
}

/// Registry and scheduler for warm tasks. Cheap to clone; clones share all
/// state.
#[derive(Clone)]
pub struct CacheWarmer {
    inner: Arc<WarmerInner>,
}

impl CacheWarmer {
    pub fn new(max_jitter: Duration) -> Self {
        Self {
            inner: Arc::new(WarmerInner {
                tasks: RwLock::new(Vec::new()),
                handles: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                max_jitter,
            }),
        }
    }

    /// Register a named warm task. If periodic warming is already active the
    /// task is scheduled immediately.
    pub fn register(
        &self,
        name: impl Into<String>,
        fetcher: impl WarmFetcher,
        interval: Duration,
    ) {
        let task = Arc::new(WarmTask {
            name: name.into(),
            fetcher: Arc::new(fetcher),
            interval,
            times: Mutex::new(TaskTimes::default()),
        });
        {
            let mut tasks = self
                .inner
                .tasks
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.push(Arc::clone(&task));
        }
        if self.inner.running.load(Ordering::SeqCst) {
            self.spawn_task_loop(task);
        }
    }

    /// Start every registered task on its own jittered interval. Idempotent.
    pub fn start_periodic_warming(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<Arc<WarmTask>> = {
            let tasks = self
                .inner
                .tasks
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.clone()
        };
        info!("starting periodic warming for {} tasks", tasks.len());
        for task in tasks {
            self.spawn_task_loop(task);
        }
    }

    /// Cancel every scheduled task. In-flight fetchers are aborted with
    /// their timers.
    pub fn stop_periodic_warming(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut handles = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("periodic warming stopped");
    }

    /// Run the named tasks (or all when `names` is `None`) right now.
    /// Failures are isolated per task. Returns the number of tasks run.
    pub async fn warm_manual(&self, names: Option<&[String]>) -> usize {
        let tasks: Vec<Arc<WarmTask>> = {
            let tasks = self
                .inner
                .tasks
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            tasks
                .iter()
                .filter(|t| names.map_or(true, |ns| ns.iter().any(|n| n == &t.name)))
                .cloned()
                .collect()
        };
        if let Some(names) = names {
            for name in names {
                if !tasks.iter().any(|t| &t.name == name) {
                    warn!("warm_manual: no task named {}", name);
                }
            }
        }
        for task in &tasks {
            task.run_once().await;
        }
        tasks.len()
    }

    pub fn get_status(&self) -> Vec<WarmTaskStatus> {
        let tasks = self
            .inner
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        tasks
            .iter()
            .map(|task| {
                let times = task.times_lock().clone();
                WarmTaskStatus {
                    name: task.name.clone(),
                    interval_ms: task.interval.as_millis() as u64,
                    last_run_at_ms: times.last_run_at.map(epoch_ms),
                    last_success_at_ms: times.last_success_at.map(epoch_ms),
                    last_error: times.last_error,
                    next_scheduled_at_ms: times.next_scheduled_at.map(epoch_ms),
                }
            })
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn spawn_task_loop(&self, task: Arc<WarmTask>) {
        let max_jitter_ms = self.inner.max_jitter.as_millis() as u64;
        // Initial jitter staggers tasks started together. Stamped before the
        // sleep so status reports the schedule as soon as warming starts.
        let initial_pause = jitter(max_jitter_ms);
        task.times_lock().next_scheduled_at = Some(SystemTime::now() + initial_pause);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_pause).await;
            loop {
                task.run_once().await;
                let pause = task.interval + jitter(max_jitter_ms);
                task.times_lock().next_scheduled_at = Some(SystemTime::now() + pause);
                tokio::time::sleep(pause).await;
            }
        });
        let mut handles = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.push(handle);
    }
}

fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
