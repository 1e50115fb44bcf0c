use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::cleanup::{retention_days, retention_hours};
use common::{
    CleanupRequest, CleanupSummary, Job, JobStatus, RetentionPolicy, SubmitResponse,
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse, WorkflowRequest, WorkflowType,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::archive::ensure_archive;
use crate::cleanup::{self, JobPaths};
use crate::error::{AppError, AppResult};
use crate::jobs::{self, DemUpload};
use crate::state::{lock, AppState, InFlight, WorkerMeta};
use crate::tasklog;

/// Tope del multipart de envío (DEMs grandes).
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/submit-job",
            post(submit_job).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id", get(get_job).delete(delete_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/jobs/:id/results", get(get_job_results))
        .route("/api/jobs/:id/dag", get(get_job_dag))
        .route("/api/jobs/:id/logs", get(get_job_logs))
        .route("/api/cleanup", post(run_cleanup))
        .route("/api/system/status", get(system_status))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP: jobs ---------------- */

async fn health(State(state): State<AppState>) -> Response {
    let config = &state.config;
    let healthy = config.uploads_dir().is_dir()
        && config.results_dir().is_dir()
        && state.registry.path().is_file();

    let timestamp = Utc::now().to_rfc3339();
    if healthy {
        Json(json!({ "status": "healthy", "timestamp": timestamp })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "timestamp": timestamp })),
        )
            .into_response()
    }
}

/// Parámetros opcionales del envío; también se aceptan como campos sueltos
/// del multipart.
#[derive(Debug, Default, Deserialize)]
struct SubmitParameters {
    step: Option<f64>,
    linke_value: Option<f64>,
    albedo_value: Option<f64>,
    num_threads: Option<u32>,
    start_year: Option<i32>,
    end_year: Option<i32>,
}

impl SubmitParameters {
    fn apply(&self, req: &mut WorkflowRequest) {
        if let Some(v) = self.step {
            req.step = v;
        }
        if let Some(v) = self.linke_value {
            req.linke_value = v;
        }
        if let Some(v) = self.albedo_value {
            req.albedo_value = v;
        }
        if let Some(v) = self.num_threads {
            req.num_threads = v;
        }
        if let Some(v) = self.start_year {
            req.start_year = v;
        }
        if let Some(v) = self.end_year {
            req.end_year = v;
        }
    }
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> AppResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid value for {name}: '{value}'")))
}

// Recibe el DEM y los parámetros, crea el job y vuelve enseguida
async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<SubmitResponse>> {
    let mut workflow_type: Option<WorkflowType> = None;
    let mut upload: Option<DemUpload> = None;
    let mut fields = SubmitParameters::default();
    let mut json_params: Option<SubmitParameters> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "dem_file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes: Bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                upload = Some(DemUpload {
                    file_name,
                    bytes: bytes.to_vec(),
                });
            }
            other => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                match other {
                    "workflow_type" => workflow_type = Some(value.trim().parse()?),
                    "parameters" => {
                        json_params = Some(serde_json::from_str(&value).map_err(|e| {
                            AppError::BadRequest(format!("invalid parameters JSON: {e}"))
                        })?)
                    }
                    "step" => fields.step = Some(parse_field(other, &value)?),
                    "linke_value" => fields.linke_value = Some(parse_field(other, &value)?),
                    "albedo_value" => fields.albedo_value = Some(parse_field(other, &value)?),
                    "num_threads" => fields.num_threads = Some(parse_field(other, &value)?),
                    "start_year" => fields.start_year = Some(parse_field(other, &value)?),
                    "end_year" => fields.end_year = Some(parse_field(other, &value)?),
                    _ => debug!("campo de multipart ignorado: {}", other),
                }
            }
        }
    }

    let workflow_type = workflow_type
        .ok_or_else(|| AppError::BadRequest("workflow_type is required".to_string()))?;
    let upload = upload.ok_or_else(|| AppError::BadRequest("dem_file is required".to_string()))?;

    let mut req = WorkflowRequest::new(workflow_type, String::new());
    fields.apply(&mut req);
    if let Some(params) = &json_params {
        params.apply(&mut req);
    }

    let job = jobs::submit(&state, req, upload).await?;
    Ok(Json(SubmitResponse {
        job_id: job.id,
        status: "submitted".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Job>>> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<JobStatus>().map_err(AppError::BadRequest))
        .transpose()?;
    Ok(Json(state.registry.list(status, query.limit)))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Job>> {
    Ok(Json(state.registry.get(&id)?))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    jobs::delete(&state, &id).await?;
    Ok(Json(json!({ "status": "success", "message": "Job deleted successfully" })))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Job>> {
    Ok(Json(jobs::cancel(&state, &id).await?))
}

// Zip con todo lo que produjo el job
async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let job = state.registry.get_completed(&id)?;
    let paths = JobPaths::for_job(&state.config, &job)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let archive = tokio::task::spawn_blocking(move || ensure_archive(&paths.results_dir, &paths.archive))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(|e| match e {
            crate::archive::ArchiveError::Missing(_) => {
                AppError::NotFound(format!("results of job {id} are not on disk"))
            }
            other => AppError::Internal(other.to_string()),
        })?;

    let bytes = tokio::fs::read(&archive).await?;
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}_results.zip\"", job.id),
        ),
    ];
    Ok((headers, bytes).into_response())
}

// Grafo del job en formato Make, mientras su dispatcher esté vivo
async fn get_job_dag(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Response> {
    state.registry.get(&id)?;
    let handle = state
        .dispatcher_for(&id)
        .ok_or_else(|| AppError::NotFound(format!("task graph of job {id} is not loaded")))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        handle.makeflow().to_string(),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

// Últimas líneas de la salida de las tareas del job
async fn get_job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> AppResult<Response> {
    state.registry.get(&id)?;
    let config = state.config.clone();
    let tail = query.tail.unwrap_or(tasklog::DEFAULT_TAIL);

    let text = tokio::task::spawn_blocking(move || tasklog::read_tail(&config, &id, tail))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

async fn run_cleanup(
    State(state): State<AppState>,
    Query(req): Query<CleanupRequest>,
) -> AppResult<Json<CleanupSummary>> {
    let defaults = state.config.retention;
    let success_retention = match req.success_retention_days {
        Some(days) => retention_days(days).ok_or_else(|| {
            AppError::BadRequest(format!("success_retention_days {days} is negative or out of range"))
        })?,
        None => defaults.success_retention,
    };
    let failed_retention = match req.failed_retention_hours {
        Some(hours) => retention_hours(hours).ok_or_else(|| {
            AppError::BadRequest(format!("failed_retention_hours {hours} is negative or out of range"))
        })?,
        None => defaults.failed_retention,
    };

    let policy = RetentionPolicy {
        success_retention,
        failed_retention,
    };

    Ok(Json(cleanup::run_cleanup(&state, policy, req.dry_run).await))
}

async fn system_status(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    let counts = state.registry.counts();
    let (alive, dead) = {
        let workers = lock(&state.workers);
        let dead = workers.values().filter(|w| w.dead).count();
        (workers.len() - dead, dead)
    };

    // estado de las tareas de cada job con dispatcher vivo
    let mut graphs = serde_json::Map::new();
    for dispatcher in state.live_dispatchers() {
        if let Some(task_counts) = dispatcher.counts().await {
            graphs.insert(dispatcher.job_id().to_string(), json!(task_counts));
        }
    }

    Json(json!({
        "active_jobs": counts.get("running").copied().unwrap_or(0),
        "jobs": counts,
        "active_dispatchers": graphs.len(),
        "task_graphs": graphs,
        "workers": { "alive": alive, "dead": dead },
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "retention": {
            "success_retention_days": config.retention.success_retention.num_days(),
            "failed_retention_hours": config.retention.failed_retention.num_hours(),
            "cleanup_enabled": config.cleanup_enabled,
        },
        "system_info": {
            "uploads_dir": config.uploads_dir(),
            "results_dir": config.results_dir(),
            "uploads_dir_exists": config.uploads_dir().is_dir(),
            "results_dir_exists": config.results_dir().is_dir(),
        },
    }))
}

/* ---------------- handlers HTTP: workers ---------------- */

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    info!(
        "worker registrado: {} ({}, cores={} mem={}MB disk={}MB)",
        worker_id, req.hostname, req.capacity.cores, req.capacity.memory_mb, req.capacity.disk_mb
    );
    lock(&state.workers).insert(worker_id.clone(), WorkerMeta::new(req.hostname, req.capacity));

    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> AppResult<Json<WorkerHeartbeatResponse>> {
    let mut workers = lock(&state.workers);
    let meta = workers
        .get_mut(&req.worker_id)
        .ok_or_else(|| AppError::NotFound(format!("worker {} not registered", req.worker_id)))?;

    meta.last_heartbeat = SystemTime::now();
    meta.last_cpu_percent = Some(req.cpu_percent);
    meta.last_mem_bytes = Some(req.mem_bytes);
    if meta.dead {
        info!("worker {} volvió a dar señales de vida", req.worker_id);
        meta.dead = false;
    }
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();
    let mut metrics: Vec<WorkerMetrics> = lock(&state.workers)
        .iter()
        .map(|(id, meta)| meta.metrics(id, now))
        .collect();
    metrics.sort_by(|a, b| a.hostname.cmp(&b.hostname).then_with(|| a.worker_id.cmp(&b.worker_id)));
    Json(metrics)
}

// Ofrece al worker la primera tarea lista que le entre, recorriendo los
// jobs en orden de envío
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> AppResult<Json<TaskAssignmentResponse>> {
    let capacity = {
        let workers = lock(&state.workers);
        match workers.get(&req.worker_id) {
            Some(meta) if !meta.dead => meta.capacity,
            _ => {
                return Err(AppError::NotFound(format!(
                    "worker {} not registered",
                    req.worker_id
                )))
            }
        }
    };

    // un worker corre una tarea por vez
    let busy = lock(&state.in_flight)
        .values()
        .any(|entry| entry.worker_id == req.worker_id);
    if busy {
        debug!("worker {} pidió tarea pero ya tiene una en vuelo", req.worker_id);
        return Ok(Json(TaskAssignmentResponse { assignment: None }));
    }

    for dispatcher in state.live_dispatchers() {
        let Some(assignment) = dispatcher.offer(&req.worker_id, capacity).await else {
            continue;
        };

        info!(
            "asignando tarea {} (job={}, intento {}) al worker {}",
            assignment.task.id, assignment.job_id, assignment.attempt, req.worker_id
        );
        lock(&state.in_flight).insert(
            (
                assignment.job_id.clone(),
                assignment.task.id.clone(),
                assignment.attempt,
            ),
            InFlight {
                worker_id: req.worker_id.clone(),
                started_at: SystemTime::now(),
            },
        );
        if let Some(meta) = lock(&state.workers).get_mut(&req.worker_id) {
            meta.tasks_started += 1;
        }
        return Ok(Json(TaskAssignmentResponse {
            assignment: Some(assignment),
        }));
    }

    Ok(Json(TaskAssignmentResponse { assignment: None }))
}

// Worker reporta que terminó una tarea
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Json<TaskCompleteResponse> {
    let key = (req.job_id.clone(), req.task_id.clone(), req.attempt);
    let inflight = lock(&state.in_flight).remove(&key);

    // ---- Métricas de worker: duración de la tarea ----
    if let Some(inflight) = inflight.filter(|i| i.worker_id == req.worker_id) {
        let duration_ms = inflight
            .started_at
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if let Some(meta) = lock(&state.workers).get_mut(&req.worker_id) {
            meta.total_task_time_ms += duration_ms;
            if req.outcome.success {
                meta.tasks_succeeded += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }
    }

    let ok = match state.dispatcher_for(&req.job_id) {
        Some(dispatcher) => {
            dispatcher
                .report(&req.worker_id, &req.task_id, req.attempt, req.outcome.clone())
                .await
        }
        None => false,
    };
    if !ok {
        debug!(
            "reporte descartado: tarea {} del job {} (intento {})",
            req.task_id, req.job_id, req.attempt
        );
        return Json(TaskCompleteResponse { ok });
    }

    // sólo los intentos aceptados quedan en el log de la tarea
    let config = state.config.clone();
    let logged = tokio::task::spawn_blocking(move || tasklog::append_attempt(&config, &req)).await;
    match logged {
        Ok(Ok(path)) => debug!("salida guardada en {}", path.display()),
        Ok(Err(err)) => warn!("no se pudo guardar la salida de la tarea: {}", err),
        Err(err) => warn!("no se pudo guardar la salida de la tarea: {}", err),
    }

    Json(TaskCompleteResponse { ok })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::registry::JobRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use common::{ResourceSpec, TaskAssignment, TaskOutcome};
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "eemt-test-boundary";

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        let config = MasterConfig::with_data_dir(dir.path());
        std::fs::create_dir_all(config.uploads_dir()).unwrap();
        std::fs::create_dir_all(config.results_dir()).unwrap();
        let registry = JobRegistry::open(config.store_path()).unwrap();
        AppState::new(config, registry)
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"dem_file\"; filename=\"{file_name}\"\r\nContent-Type: image/tiff\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Bytes) {
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    async fn post_json(state: &AppState, uri: &str, value: Value) -> (StatusCode, Value) {
        let req = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap();
        let (status, body) = send(state, req).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
        let (status, body) = send(state, Request::get(uri).body(Body::empty()).unwrap()).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn submit(state: &AppState, fields: &[(&str, &str)], file: (&str, &[u8])) -> (StatusCode, Value) {
        let req = Request::post("/api/submit-job")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(multipart_body(fields, Some(file)))
            .unwrap();
        let (status, body) = send(state, req).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn register(state: &AppState) -> String {
        let (status, body) = post_json(
            state,
            "/api/v1/workers/register",
            json!({ "hostname": "nodo-1", "capacity": ResourceSpec::new(8, 16384, 51200) }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["worker_id"].as_str().unwrap().to_string()
    }

    /// Pide tarea hasta que el dispatcher del job esté listo.
    async fn next_task(state: &AppState, worker_id: &str) -> Option<TaskAssignment> {
        for _ in 0..200 {
            let (status, body) =
                post_json(state, "/api/v1/tasks/next", json!({ "worker_id": worker_id })).await;
            assert_eq!(status, StatusCode::OK);
            let resp: TaskAssignmentResponse = serde_json::from_value(body).unwrap();
            if resp.assignment.is_some() {
                return resp.assignment;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    async fn complete(state: &AppState, worker_id: &str, a: &TaskAssignment, outcome: TaskOutcome) -> bool {
        let req = TaskCompleteRequest {
            worker_id: worker_id.to_string(),
            job_id: a.job_id.clone(),
            task_id: a.task.id.clone(),
            attempt: a.attempt,
            outcome,
        };
        let (status, body) =
            post_json(state, "/api/v1/tasks/complete", serde_json::to_value(req).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        body["ok"].as_bool().unwrap()
    }

    #[tokio::test]
    async fn health_responde_503_sin_directorios() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (status, body) = get_json(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        std::fs::remove_dir_all(state.config.results_dir()).unwrap();
        let (status, _) = get_json(&state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn submit_rechaza_extension_invalida() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let (status, body) = submit(&state, &[("workflow_type", "sol")], ("dem.png", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
        assert!(state.registry.list(None, None).is_empty());

        let (status, _) = submit(
            &state,
            &[("workflow_type", "eemt"), ("start_year", "2021"), ("end_year", "2020")],
            ("dem.tif", b"x"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = submit(&state, &[("workflow_type", "lidar")], ("dem.tif", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn job_solar_completo_con_progreso_monotono() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let (status, body) = submit(
            &state,
            &[("workflow_type", "sol"), ("step", "15"), ("num_threads", "2")],
            ("dem.tif", &[0u8; 100]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "submitted");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let job = state.registry.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(dir
            .path()
            .join("uploads")
            .join(format!("{job_id}_dem.tif"))
            .is_file());

        let worker = register(&state).await;
        let mut last_progress = 0;
        let mut executed = 0;
        let mut seen_running = false;

        while let Some(a) = next_task(&state, &worker).await {
            seen_running |= state.registry.get(&job_id).unwrap().status == JobStatus::Running;
            assert!(complete(&state, &worker, &a, TaskOutcome::succeeded()).await);
            executed += 1;

            let job = state.registry.get(&job_id).unwrap();
            assert!(job.progress >= last_progress);
            last_progress = job.progress;
            if job.status.is_terminal() {
                break;
            }
        }

        assert!(seen_running);
        assert_eq!(executed, 365 + 12);
        let (status, body) = get_json(&state, &format!("/api/jobs/{job_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["progress"], 100);

        let (_, workers) = get_json(&state, "/api/v1/workers").await;
        assert_eq!(workers[0]["tasks_succeeded"], 377);
    }

    #[tokio::test]
    async fn cuatro_fallas_de_un_dia_fallan_el_job() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (_, body) = submit(&state, &[("workflow_type", "sol")], ("dem.tif", b"x")).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();
        let worker = register(&state).await;

        let mut failures = 0;
        while let Some(a) = next_task(&state, &worker).await {
            let outcome = if a.task.id == "sol-day-001" {
                failures += 1;
                TaskOutcome::failed(1, format!("r.sun stderr intento {}", a.attempt))
            } else {
                TaskOutcome::succeeded()
            };
            complete(&state, &worker, &a, outcome).await;
            if state.registry.get(&job_id).unwrap().status.is_terminal() {
                break;
            }
        }

        assert_eq!(failures, 4);
        let job = state.registry.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("r.sun stderr intento 4"));

        // resultados de un job fallido: 404
        let (status, _) = get_json(&state, &format!("/api/jobs/{job_id}/results")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_guardan_la_salida_de_cada_intento() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (_, body) = submit(&state, &[("workflow_type", "sol")], ("dem.tif", b"x")).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();
        let worker = register(&state).await;

        let (status, text) = send(&state, Request::get(format!("/api/jobs/{job_id}/logs")).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8_lossy(&text), tasklog::NO_LOGS_MESSAGE);

        let first = next_task(&state, &worker).await.unwrap();
        complete(&state, &worker, &first, TaskOutcome::failed(1, "ERROR: sin memoria")).await;
        let retry = next_task(&state, &worker).await.unwrap();
        assert_eq!(retry.task.id, first.task.id);
        complete(&state, &worker, &retry, TaskOutcome::succeeded().with_output("r.sun: 100%")).await;

        let uri = format!("/api/jobs/{job_id}/logs?tail=0");
        let (status, text) = send(&state, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains(&format!("--- {}.log ---", first.task.id)));
        assert!(text.contains("ERROR: sin memoria"));
        assert!(text.contains("r.sun: 100%"));

        // sólo la última línea
        let uri = format!("/api/jobs/{job_id}/logs?tail=1");
        let (_, text) = send(&state, Request::get(uri).body(Body::empty()).unwrap()).await;
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("r.sun: 100%"));
        assert!(!text.contains("ERROR: sin memoria"));

        let (status, _) = get_json(&state, "/api/jobs/no-existe/logs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancelar_y_borrar() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (_, body) = submit(&state, &[("workflow_type", "sol")], ("dem.tif", b"x")).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();
        let worker = register(&state).await;
        let a = next_task(&state, &worker).await.unwrap();

        // activo: no se puede borrar
        let req = Request::delete(format!("/api/jobs/{job_id}")).body(Body::empty()).unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = post_json(&state, &format!("/api/jobs/{job_id}/cancel"), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        complete(&state, &worker, &a, TaskOutcome::succeeded()).await;

        let job = state.registry.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("Job cancelled by user"));

        let (status, _) = post_json(&state, &format!("/api/jobs/{job_id}/cancel"), Value::Null).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let req = Request::delete(format!("/api/jobs/{job_id}")).body(Body::empty()).unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!dir.path().join("uploads").join(format!("{job_id}_dem.tif")).exists());

        let (status, body) = get_json(&state, &format!("/api/jobs/{job_id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn resultados_se_sirven_como_zip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let id = uuid::Uuid::new_v4().to_string();
        let req = WorkflowRequest::new(WorkflowType::Sol, "x.tif");
        state
            .registry
            .insert(Job::new(id.clone(), req, format!("{id}_dem.tif")))
            .unwrap();

        let (status, _) = get_json(&state, &format!("/api/jobs/{id}/results")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.registry.apply_event(&id, &common::JobEvent::Completed).unwrap();
        let out = state.config.results_dir().join(&id).join("insol/monthly");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("hours_sun_01_average.tif"), b"data").unwrap();

        let resp = build_router(state.clone())
            .oneshot(Request::get(format!("/api/jobs/{id}/results")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/zip");
        assert!(state.config.results_dir().join(format!("{id}_results.zip")).is_file());
    }

    #[tokio::test]
    async fn listado_filtra_por_estado() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let req = WorkflowRequest::new(WorkflowType::Sol, "x.tif");
        state.registry.insert(Job::new("a".into(), req.clone(), String::new())).unwrap();
        state.registry.insert(Job::new("b".into(), req, String::new())).unwrap();
        state.registry.apply_event("b", &common::JobEvent::Completed).unwrap();

        let (status, body) = get_json(&state, "/api/jobs?status=completed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "b");

        let (status, _) = get_json(&state, "/api/jobs?status=raro").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cleanup_dry_run_por_http() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (status, body) = post_json(&state, "/api/cleanup?dry_run=true&success_retention_days=1", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dry_run"], true);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 0);

        let (status, _) = post_json(&state, "/api/cleanup?failed_retention_hours=-1", Value::Null).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cleanup_con_retencion_enorme_es_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (status, body) = post_json(
            &state,
            "/api/cleanup?dry_run=true&success_retention_days=200000000000",
            Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");

        let (status, _) = post_json(
            &state,
            &format!("/api/cleanup?dry_run=true&failed_retention_hours={}", i64::MAX),
            Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn worker_desconocido_recibe_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (status, _) = post_json(
            &state,
            "/api/v1/workers/heartbeat",
            json!({ "worker_id": "nadie", "cpu_percent": 1.0, "mem_bytes": 1 }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post_json(&state, "/api/v1/tasks/next", json!({ "worker_id": "nadie" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn worker_muerto_devuelve_su_tarea_a_la_cola() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (_, body) = submit(&state, &[("workflow_type", "sol")], ("dem.tif", b"x")).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let w1 = register(&state).await;
        let first = next_task(&state, &w1).await.unwrap();

        // w1 deja de mandar heartbeats
        let later = SystemTime::now() + Duration::from_secs(60);
        let dead = crate::monitor::check_workers(&state, later).await;
        assert!(dead.contains(&w1));

        let w2 = register(&state).await;
        let mut again = None;
        for _ in 0..400 {
            let a = next_task(&state, &w2).await.unwrap();
            if a.task.id == first.task.id {
                again = Some(a);
                break;
            }
            complete(&state, &w2, &a, TaskOutcome::succeeded()).await;
        }
        let again = again.unwrap();
        assert_eq!(again.attempt, first.attempt + 1);

        // el reporte tardío de w1 se descarta
        assert!(!complete(&state, &w1, &first, TaskOutcome::succeeded()).await);

        let (status, dag) = send(
            &state,
            Request::get(format!("/api/jobs/{job_id}/dag")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&dag).contains("CATEGORY=\"solar-day\""));
    }
}
