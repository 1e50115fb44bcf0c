use anyhow::{bail, Result};
use common::{
    TaskAssignment, TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest,
    TaskCompleteResponse, TaskOutcome, WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use sysinfo::{CpuExt, System, SystemExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::processor::{CommandProcessor, RasterProcessor};

#[derive(Debug, Error)]
pub enum MasterError {
    /// El master no conoce (o dio por muerto) a este worker
    #[error("worker is not registered on the master")]
    UnknownWorker,

    #[error("master returned status {0}")]
    Status(StatusCode),

    #[error("HTTP error talking to the master: {0}")]
    Http(#[from] reqwest::Error),
}

/// Cliente HTTP del protocolo worker <-> master.
#[derive(Debug, Clone)]
pub struct MasterClient {
    http: Client,
    base_url: String,
}

impl MasterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn register(&self, req: &WorkerRegisterRequest) -> Result<WorkerId, MasterError> {
        let res = self
            .http
            .post(self.url("/api/v1/workers/register"))
            .json(req)
            .send()
            .await?;
        let WorkerRegisterResponse { worker_id } = check(res)?.json().await?;
        Ok(worker_id)
    }

    pub async fn heartbeat(&self, req: &WorkerHeartbeatRequest) -> Result<(), MasterError> {
        let res = self
            .http
            .post(self.url("/api/v1/workers/heartbeat"))
            .json(req)
            .send()
            .await?;
        check(res)?;
        Ok(())
    }

    pub async fn next_task(&self, worker_id: &str) -> Result<Option<TaskAssignment>, MasterError> {
        let res = self
            .http
            .post(self.url("/api/v1/tasks/next"))
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.to_string(),
            })
            .send()
            .await?;
        let resp: TaskAssignmentResponse = check(res)?.json().await?;
        Ok(resp.assignment)
    }

    /// `false` si el master descartó el reporte por viejo.
    pub async fn complete(&self, req: &TaskCompleteRequest) -> Result<bool, MasterError> {
        let res = self
            .http
            .post(self.url("/api/v1/tasks/complete"))
            .json(req)
            .send()
            .await?;
        let resp: TaskCompleteResponse = check(res)?.json().await?;
        Ok(resp.ok)
    }
}

fn check(res: reqwest::Response) -> Result<reqwest::Response, MasterError> {
    match res.status() {
        s if s.is_success() => Ok(res),
        StatusCode::NOT_FOUND => Err(MasterError::UnknownWorker),
        s => Err(MasterError::Status(s)),
    }
}

/// Ejecuta la tarea y traduce el resultado al formato del protocolo.
pub async fn execute<P: RasterProcessor + ?Sized>(processor: &P, assignment: &TaskAssignment) -> TaskOutcome {
    let task = &assignment.task;
    info!(
        "ejecutando tarea {} del job {} (intento {}, categoría {})",
        task.id, assignment.job_id, assignment.attempt, task.category
    );

    match processor.run_task(task).await {
        Ok(output) => {
            info!("terminé tarea {} correctamente", task.id);
            TaskOutcome::succeeded().with_output(output)
        }
        Err(err) => {
            warn!("tarea {} falló: {}", task.id, err);
            TaskOutcome::failed(err.exit_code(), err.diagnostic())
        }
    }
}

/// Registro con reintentos; se rinde después de `reconnect_attempts`.
async fn register(client: &MasterClient, config: &WorkerConfig, hostname: &str) -> Result<WorkerId> {
    let req = WorkerRegisterRequest {
        hostname: hostname.to_string(),
        capacity: config.capacity,
    };

    for attempt in 1..=config.reconnect_attempts.max(1) {
        match client.register(&req).await {
            Ok(worker_id) => {
                info!(
                    "worker {} registrado contra {} (cores={} mem={}MB disk={}MB)",
                    worker_id,
                    config.master_url,
                    config.capacity.cores,
                    config.capacity.memory_mb,
                    config.capacity.disk_mb
                );
                return Ok(worker_id);
            }
            Err(err) => {
                warn!(
                    "no se pudo registrar (intento {}/{}): {}",
                    attempt, config.reconnect_attempts, err
                );
                sleep(config.reconnect_delay).await;
            }
        }
    }
    bail!(
        "could not register with master at {} after {} attempts",
        config.master_url,
        config.reconnect_attempts
    )
}

/// Heartbeats periódicos con CPU/memoria del host.
async fn heartbeat_loop(client: MasterClient, interval: Duration, worker_id: watch::Receiver<WorkerId>) {
    // System para leer CPU y memoria
    let mut sys = System::new();
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        sys.refresh_cpu();
        sys.refresh_memory();

        let req = WorkerHeartbeatRequest {
            worker_id: worker_id.borrow().clone(),
            cpu_percent: sys.global_cpu_info().cpu_usage(),
            // used_memory ya viene en bytes
            mem_bytes: sys.used_memory(),
        };
        match client.heartbeat(&req).await {
            Ok(()) => debug!("heartbeat enviado"),
            Err(err) => warn!("heartbeat falló: {}", err),
        }
    }
}

/// Loop principal del worker.
/// - Se registra en el master anunciando su capacidad.
/// - Hace heartbeats periódicos en una tarea aparte.
/// - Pide tareas de a una, las ejecuta y reporta el resultado.
/// - Si el master lo olvidó, se vuelve a registrar.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let client = MasterClient::new(config.master_url.clone());
    let processor = CommandProcessor::new(&config.work_dir);

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let mut worker_id = register(&client, &config, &hostname).await?;
    let (id_tx, id_rx) = watch::channel(worker_id.clone());
    let heartbeat = tokio::spawn(heartbeat_loop(client.clone(), config.heartbeat_interval, id_rx));

    let mut consecutive_errors = 0u32;
    let result = loop {
        let assignment = match client.next_task(&worker_id).await {
            Ok(assignment) => {
                consecutive_errors = 0;
                assignment
            }
            Err(MasterError::UnknownWorker) => {
                warn!("el master no reconoce al worker {}, re-registrando", worker_id);
                match register(&client, &config, &hostname).await {
                    Ok(id) => {
                        worker_id = id;
                        let _ = id_tx.send(worker_id.clone());
                        continue;
                    }
                    Err(err) => break Err(err),
                }
            }
            Err(err) => {
                consecutive_errors += 1;
                warn!(
                    "error pidiendo tarea ({}/{}): {}",
                    consecutive_errors, config.reconnect_attempts, err
                );
                if consecutive_errors >= config.reconnect_attempts.max(1) {
                    break Err(anyhow::anyhow!("master unreachable at {}: {}", config.master_url, err));
                }
                sleep(config.reconnect_delay).await;
                continue;
            }
        };

        let Some(assignment) = assignment else {
            debug!("worker {} pidió tarea pero no hay", worker_id);
            sleep(config.poll_interval).await;
            continue;
        };

        let outcome = execute(&processor, &assignment).await;
        report(&client, &config, &worker_id, &assignment, outcome).await;
    };

    heartbeat.abort();
    result
}

/// Reporta el resultado, reintentando si el master no responde.
async fn report(
    client: &MasterClient,
    config: &WorkerConfig,
    worker_id: &str,
    assignment: &TaskAssignment,
    outcome: TaskOutcome,
) {
    let req = TaskCompleteRequest {
        worker_id: worker_id.to_string(),
        job_id: assignment.job_id.clone(),
        task_id: assignment.task.id.clone(),
        attempt: assignment.attempt,
        outcome,
    };

    for attempt in 1..=config.reconnect_attempts.max(1) {
        match client.complete(&req).await {
            Ok(true) => return,
            Ok(false) => {
                info!("el master descartó el reporte de {} (intento viejo)", req.task_id);
                return;
            }
            Err(err) => {
                warn!(
                    "no se pudo reportar {} ({}/{}): {}",
                    req.task_id, attempt, config.reconnect_attempts, err
                );
                sleep(config.reconnect_delay).await;
            }
        }
    }
    // el master la va a reencolar por timeout o por heartbeat
    warn!("se abandona el reporte de la tarea {}", req.task_id);
}
