//! Ciclo de vida de un job del lado del master: envío, cancelación y
//! borrado.

use std::path::Path;

use common::{build, BuildOptions, Job, JobEvent, JobStatus, WorkflowRequest};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cleanup::JobPaths;
use crate::dispatcher;
use crate::error::{AppError, AppResult};
use crate::scheduler::CANCELLED_MESSAGE;
use crate::state::AppState;

/// DEM recibido en el multipart.
#[derive(Debug, Clone)]
pub struct DemUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Valida el pedido, guarda el DEM, crea el job `pending` y lanza en
/// segundo plano la construcción del grafo y su dispatcher.
pub async fn submit(state: &AppState, mut req: WorkflowRequest, upload: DemUpload) -> AppResult<Job> {
    // sólo el nombre, nunca una ruta del cliente
    let file_name = Path::new(&upload.file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::BadRequest("DEM upload has no file name".to_string()))?;

    if !common::workflow::has_dem_extension(&file_name) {
        return Err(AppError::BadRequest(
            "DEM file must be a GeoTIFF (.tif or .tiff)".to_string(),
        ));
    }

    let job_id = Uuid::new_v4().to_string();
    let dem_filename = format!("{job_id}_{file_name}");
    let dem_path = state.config.uploads_dir().join(&dem_filename);
    req.dem_path = dem_path.to_string_lossy().to_string();
    req.validate()?;

    tokio::fs::create_dir_all(state.config.uploads_dir()).await?;
    tokio::fs::write(&dem_path, &upload.bytes).await?;
    info!(job = %job_id, "DEM guardado: {}", dem_filename);

    let job = Job::new(job_id.clone(), req, dem_filename);
    if let Err(err) = state.registry.insert(job.clone()) {
        let _ = tokio::fs::remove_file(&dem_path).await;
        return Err(err.into());
    }
    info!(job = %job_id, workflow = %job.workflow_type, "job creado");

    let bg_state = state.clone();
    let bg_job = job.clone();
    tokio::spawn(async move { launch(bg_state, bg_job).await });

    Ok(job)
}

/// Arma el grafo del job y le asigna un dispatcher. Si falla la
/// construcción, el job queda `failed` con el error.
pub async fn launch(state: AppState, job: Job) {
    let opts = BuildOptions {
        output_root: state.config.results_dir().join(&job.id),
        processor: state.config.processor.clone(),
    };
    let req = job.parameters.clone();
    let built = tokio::task::spawn_blocking(move || build(&req, &opts)).await;

    let graph = match built {
        Ok(Ok(graph)) => graph,
        Ok(Err(err)) => {
            warn!(job = %job.id, "no se pudo construir el grafo: {}", err);
            fail(&state, &job.id, err.to_string());
            return;
        }
        Err(err) => {
            fail(&state, &job.id, format!("graph construction panicked: {err}"));
            return;
        }
    };

    // cancelado mientras se construía
    if state.registry.is_settled(&job.id) {
        info!(job = %job.id, "job terminado antes de tener dispatcher");
        return;
    }

    let handle = dispatcher::spawn(
        job.id.clone(),
        graph,
        state.config.limits,
        state.config.task_timeout,
        state.registry.clone(),
    );
    state.add_dispatcher(handle.clone());

    if state.registry.is_settled(&job.id) {
        handle.cancel().await;
    }
}

fn fail(state: &AppState, job_id: &str, error: String) {
    if let Err(err) = state.registry.apply_event(job_id, &JobEvent::Failed { error }) {
        warn!(job = %job_id, "no se pudo marcar el job como fallido: {}", err);
    }
}

/// Deja de programar tareas del job. El job pasa a `failed` cuando
/// terminan las que están corriendo.
pub async fn cancel(state: &AppState, job_id: &str) -> AppResult<Job> {
    let job = state.registry.get(job_id)?;
    if job.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "job {job_id} is already {}",
            job.status
        )));
    }

    match state.dispatcher_for(job_id) {
        Some(handle) => {
            info!(job = %job_id, "cancelando job");
            handle.cancel().await;
        }
        None => {
            // todavía construyendo el grafo: no hay nada en vuelo
            info!(job = %job_id, "cancelando job sin dispatcher");
            fail(state, job_id, CANCELLED_MESSAGE.to_string());
        }
    }

    Ok(state.registry.get(job_id)?)
}

/// Borra la fila y los datos en disco. Un job activo no se borra.
pub async fn delete(state: &AppState, job_id: &str) -> AppResult<()> {
    let job = state.registry.get(job_id)?;
    if job.status == JobStatus::Pending || job.status == JobStatus::Running {
        return Err(AppError::Conflict(format!(
            "cannot delete job {job_id} while it is {}, cancel it first",
            job.status
        )));
    }

    let paths = JobPaths::for_job(&state.config, &job)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    state.registry.delete(job_id)?;

    let removed = tokio::task::spawn_blocking(move || paths.remove()).await;
    match removed {
        Ok(Ok(())) => info!(job = %job_id, "job borrado"),
        Ok(Err(err)) => warn!(job = %job_id, "job borrado, pero quedaron datos: {}", err),
        Err(err) => warn!(job = %job_id, "job borrado, pero falló el borrado de datos: {}", err),
    }
    Ok(())
}
