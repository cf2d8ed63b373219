//! Graceful Shutdown & Task Registry
//!
//! Tracks in-flight work per worker, advertises liveness through a
//! heartbeat key, and reclaims task records orphaned by crashed
//! workers. Tracking is in-memory first and mirrored to the
//! coordination store; when the store is down the registry keeps
//! working memory-only and simply stops persisting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::error::{GuardrailError, Result};
use crate::store::CoordinationStore;

const TASK_PREFIX: &str = "active_task:";
const HEARTBEAT_PREFIX: &str = "worker_heartbeat:";

/// Stored task record, JSON-mirrored to the coordination store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_id: String,
    pub task_type: String,
    pub correlation_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub worker_id: String,
    #[serde(default)]
    pub context_data: serde_json::Value,
}

/// Stored heartbeat snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub active_tasks: usize,
    pub task_types: Vec<String>,
}

/// Orphaned task found by a sweep
#[derive(Debug, Clone, Serialize)]
pub struct OrphanReport {
    pub key: String,
    pub task: WorkerTask,
    pub age_secs: i64,
}

/// Best-effort cleanup invoked for tasks still outstanding at drain timeout
pub type CleanupCallback = Box<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

struct TrackedTask {
    task: WorkerTask,
    cleanup: Option<CleanupCallback>,
}

/// Registry statistics (admin surface)
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub worker_id: String,
    pub is_shutting_down: bool,
    pub active_tasks: usize,
    pub task_summary: HashMap<String, usize>,
}

struct RegistryInner {
    worker_id: String,
    config: RegistryConfig,
    store: Arc<dyn CoordinationStore>,
    active: RwLock<HashMap<String, TrackedTask>>,
    shutting_down: AtomicBool,
}

impl RegistryInner {
    fn task_key(&self, task_id: &str) -> String {
        format!("{}{}:{}", TASK_PREFIX, self.worker_id, task_id)
    }

    async fn persist_task(&self, task: &WorkerTask) {
        let ttl = Duration::from_secs(self.config.task_ttl_secs);
        let payload = match serde_json::to_string(task) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to encode task record {}: {}", task.task_id, e);
                return;
            }
        };
        if let Err(e) = self.store.set_ex(&self.task_key(&task.task_id), &payload, ttl).await {
            warn!("Failed to persist active task {}: {}", task.task_id, e);
        }
    }

    async fn remove_task(&self, task_id: &str) {
        let removed = {
            let mut active = self.active.write().await;
            active.remove(task_id).is_some()
        };
        if let Err(e) = self.store.del(&self.task_key(task_id)).await {
            warn!("Failed to remove persisted task {}: {}", task_id, e);
        }
        if removed {
            info!("Finished tracking task [{}]", task_id);
        }
    }

    async fn send_heartbeat(&self) {
        let snapshot = {
            let active = self.active.read().await;
            let mut task_types: Vec<String> = active
                .values()
                .map(|t| t.task.task_type.clone())
                .collect();
            task_types.sort();
            task_types.dedup();
            HeartbeatSnapshot {
                worker_id: self.worker_id.clone(),
                timestamp: Utc::now(),
                active_tasks: active.len(),
                task_types,
            }
        };

        let key = format!("{}{}", HEARTBEAT_PREFIX, self.worker_id);
        let ttl = Duration::from_secs(self.config.heartbeat_ttl_secs);
        match serde_json::to_string(&snapshot) {
            Ok(payload) => {
                if let Err(e) = self.store.set_ex(&key, &payload, ttl).await {
                    warn!("Failed to send heartbeat: {}", e);
                }
            }
            Err(e) => error!("Failed to encode heartbeat: {}", e),
        }

        // Keep task record TTLs ahead of the heartbeat while we are alive.
        let task_ttl = Duration::from_secs(self.config.task_ttl_secs);
        let ids: Vec<String> = {
            let active = self.active.read().await;
            active.keys().cloned().collect()
        };
        for task_id in ids {
            let _ = self.store.expire(&self.task_key(&task_id), task_ttl).await;
        }
    }
}

/// Per-worker task registry with graceful-shutdown drain
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RegistryConfig) -> Self {
        let worker_id = format!("worker_{}", Uuid::new_v4().simple());
        Self::with_worker_id(store, config, worker_id)
    }

    pub fn with_worker_id(
        store: Arc<dyn CoordinationStore>,
        config: RegistryConfig,
        worker_id: String,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                worker_id,
                config,
                store,
                active: RwLock::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Start the heartbeat loop and run a startup orphan sweep
    pub async fn start(&self) -> Vec<OrphanReport> {
        info!("Starting task registry for worker {}", self.inner.worker_id);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(inner.config.heartbeat_interval_secs);
            loop {
                inner.send_heartbeat().await;
                tokio::time::sleep(interval).await;
                if inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
            }
        });
        *self.heartbeat.lock().await = Some(handle);

        self.sweep_orphans().await
    }

    /// Track a unit of work until its guard is completed or dropped.
    ///
    /// Rejected once shutdown has begun.
    pub async fn track(
        &self,
        task_type: &str,
        task_id: Option<String>,
        cleanup: Option<CleanupCallback>,
        context_data: serde_json::Value,
    ) -> Result<TaskGuard> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(GuardrailError::ShuttingDown);
        }

        let task_id =
            task_id.unwrap_or_else(|| format!("{}_{}", task_type, Uuid::new_v4().simple()));
        let task = WorkerTask {
            task_id: task_id.clone(),
            task_type: task_type.to_string(),
            correlation_id: None,
            started_at: Utc::now(),
            worker_id: self.inner.worker_id.clone(),
            context_data,
        };

        {
            let mut active = self.inner.active.write().await;
            active.insert(
                task_id.clone(),
                TrackedTask {
                    task: task.clone(),
                    cleanup,
                },
            );
        }
        self.inner.persist_task(&task).await;

        info!("Started tracking task: {} [{}]", task_type, task_id);
        Ok(TaskGuard {
            inner: self.inner.clone(),
            task_id,
            completed: false,
        })
    }

    /// Scan all workers' task records and reclaim orphans.
    ///
    /// A record is orphaned when its worker's heartbeat key is gone and
    /// the record is older than the grace threshold (kept above one
    /// heartbeat interval so transient store latency does not trigger a
    /// false positive). Orphans are logged and deleted; business-level
    /// recovery is out of scope here.
    pub async fn sweep_orphans(&self) -> Vec<OrphanReport> {
        let keys = match self.inner.store.scan_prefix(TASK_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to scan for orphaned tasks: {}", e);
                return Vec::new();
            }
        };

        let mut orphans = Vec::new();
        for key in keys {
            let raw = match self.inner.store.get(&key).await {
                Ok(Some(raw)) => raw,
                _ => continue,
            };
            let task: WorkerTask = match serde_json::from_str(&raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!("Invalid task record under {}: {}", key, e);
                    continue;
                }
            };

            let heartbeat_key = format!("{}{}", HEARTBEAT_PREFIX, task.worker_id);
            let alive = matches!(self.inner.store.get(&heartbeat_key).await, Ok(Some(_)));
            if alive {
                continue;
            }

            let age_secs = Utc::now()
                .signed_duration_since(task.started_at)
                .num_seconds();
            if age_secs <= self.inner.config.orphan_grace_secs as i64 {
                continue;
            }

            warn!(
                "Orphaned task detected: {} [{}] from worker {}, age {}s",
                task.task_type, task.task_id, task.worker_id, age_secs
            );
            if let Err(e) = self.inner.store.del(&key).await {
                error!("Failed to clean up orphaned task {}: {}", key, e);
                continue;
            }
            orphans.push(OrphanReport {
                key,
                task,
                age_secs,
            });
        }

        if !orphans.is_empty() {
            warn!("Reclaimed {} orphaned task record(s)", orphans.len());
        }
        orphans
    }

    /// Drain active tasks and stop the heartbeat.
    ///
    /// Stops accepting new work immediately, waits up to the drain
    /// timeout for active tasks to finish, then force-runs cleanup
    /// callbacks for anything still outstanding.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting graceful shutdown for {}", self.inner.worker_id);

        let deadline =
            std::time::Instant::now() + Duration::from_secs(self.inner.config.drain_timeout_secs);
        let poll = Duration::from_millis(self.inner.config.drain_poll_interval_ms);

        loop {
            let remaining = {
                let active = self.inner.active.read().await;
                active.len()
            };
            if remaining == 0 {
                break;
            }
            if std::time::Instant::now() >= deadline {
                warn!("Drain timeout with {} task(s) outstanding", remaining);
                self.force_cleanup().await;
                break;
            }
            debug!("Waiting for {} active task(s) to complete", remaining);
            tokio::time::sleep(poll).await;
        }

        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
        info!("Graceful shutdown completed for {}", self.inner.worker_id);
    }

    async fn force_cleanup(&self) {
        let stragglers: Vec<(String, Option<futures::future::BoxFuture<'static, ()>>)> = {
            let mut active = self.inner.active.write().await;
            active
                .drain()
                .map(|(id, t)| (id, t.cleanup.map(|cb| cb())))
                .collect()
        };

        for (task_id, cleanup) in stragglers {
            warn!("Forcefully terminating task [{}]", task_id);
            if let Some(fut) = cleanup {
                fut.await;
            }
            let _ = self.inner.store.del(&self.inner.task_key(&task_id)).await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> RegistryStats {
        let active = self.inner.active.read().await;
        let mut task_summary: HashMap<String, usize> = HashMap::new();
        for t in active.values() {
            *task_summary.entry(t.task.task_type.clone()).or_insert(0) += 1;
        }
        RegistryStats {
            worker_id: self.inner.worker_id.clone(),
            is_shutting_down: self.is_shutting_down(),
            active_tasks: active.len(),
            task_summary,
        }
    }

    /// Immediately publish a heartbeat (normally driven by the loop)
    pub async fn heartbeat_now(&self) {
        self.inner.send_heartbeat().await;
    }
}

/// Scoped handle for a tracked task
pub struct TaskGuard {
    inner: Arc<RegistryInner>,
    task_id: String,
    completed: bool,
}

impl TaskGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Mark the task finished, removing both records
    pub async fn complete(mut self) {
        self.completed = true;
        self.inner.remove_task(&self.task_id).await;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // Dropped without explicit completion (early return or panic
        // path). Remove the in-memory record now and the stored mirror
        // in the background; its TTL bounds the worst case.
        let inner = self.inner.clone();
        let task_id = self.task_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                inner.remove_task(&task_id).await;
            });
        }
    }
}
