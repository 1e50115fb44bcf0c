// master/src/state.rs

use chrono::{DateTime, Utc};
use common::{JobId, ResourceSpec, TaskId, WorkerId, WorkerMetrics};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use crate::config::MasterConfig;
use crate::dispatcher::DispatcherHandle;
use crate::registry::JobRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MasterConfig>,
    pub registry: Arc<JobRegistry>,
    // un dispatcher vivo por job, en orden de envío
    pub dispatchers: Arc<Mutex<Vec<DispatcherHandle>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // tareas asignadas y todavía no reportadas, para las métricas
    pub in_flight: Arc<Mutex<HashMap<InFlightKey, InFlight>>>,
    // una sola pasada de limpieza a la vez
    pub cleanup_lock: Arc<tokio::sync::Mutex<()>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: MasterConfig, registry: JobRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            dispatchers: Arc::new(Mutex::new(Vec::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cleanup_lock: Arc::new(tokio::sync::Mutex::new(())),
            started_at: Utc::now(),
        }
    }

    pub fn add_dispatcher(&self, handle: DispatcherHandle) {
        lock(&self.dispatchers).push(handle);
    }

    /// Handles vivos; de paso descarta los de jobs ya terminados.
    pub fn live_dispatchers(&self) -> Vec<DispatcherHandle> {
        let mut dispatchers = lock(&self.dispatchers);
        dispatchers.retain(|d| !d.is_closed());
        dispatchers.clone()
    }

    pub fn dispatcher_for(&self, job_id: &str) -> Option<DispatcherHandle> {
        self.live_dispatchers()
            .into_iter()
            .find(|d| d.job_id() == job_id)
    }
}

/// `lock()` que no propaga el envenenamiento del mutex.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub capacity: ResourceSpec,
    pub last_heartbeat: SystemTime,
    pub dead: bool,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, capacity: ResourceSpec) -> Self {
        Self {
            hostname,
            capacity,
            last_heartbeat: SystemTime::now(),
            dead: false,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }

    pub fn metrics(&self, worker_id: &str, now: SystemTime) -> WorkerMetrics {
        let finished = self.tasks_succeeded + self.tasks_failed;
        WorkerMetrics {
            worker_id: worker_id.to_string(),
            hostname: self.hostname.clone(),
            dead: self.dead,
            capacity: self.capacity,
            last_heartbeat_secs_ago: now
                .duration_since(self.last_heartbeat)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            last_cpu_percent: self.last_cpu_percent,
            last_mem_bytes: self.last_mem_bytes,
            tasks_started: self.tasks_started,
            tasks_succeeded: self.tasks_succeeded,
            tasks_failed: self.tasks_failed,
            avg_task_ms: (finished > 0).then(|| self.total_task_time_ms as f64 / finished as f64),
        }
    }
}

/// (job, tarea, intento)
pub type InFlightKey = (JobId, TaskId, u32);

#[derive(Debug, Clone)]
pub struct InFlight {
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}
