//! Limpieza por retención de los datos en disco de jobs terminados.
//!
//! Sólo se borran datos: la fila del job queda en el registro (con
//! `data_cleaned_at`) tanto para completados como para fallidos.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{CleanupSummary, Job, JobCleanupOutcome, JobStatus, RetentionPolicy};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{retention_from_env, MasterConfig};
use crate::registry::JobRegistry;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("upload name '{name}' does not belong to job {job_id}")]
    InvalidUpload { job_id: String, name: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("bad glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// `true` sólo para un UUID v4 en su forma canónica (minúsculas, guiones).
pub fn is_valid_job_id(id: &str) -> bool {
    Uuid::parse_str(id)
        .map(|u| u.get_version_num() == 4 && u.to_string() == id)
        .unwrap_or(false)
}

/// Rutas en disco de un job, ya validadas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub results_dir: PathBuf,
    pub archive: PathBuf,
    pub upload: Option<PathBuf>,
}

impl JobPaths {
    /// Valida el id y el nombre del upload antes de armar cualquier ruta.
    pub fn for_job(config: &MasterConfig, job: &Job) -> Result<Self, CleanupError> {
        if !is_valid_job_id(&job.id) {
            return Err(CleanupError::InvalidJobId(job.id.clone()));
        }

        let upload = if job.dem_filename.is_empty() {
            None
        } else {
            let name = &job.dem_filename;
            // un solo componente normal dentro de uploads/
            let single = matches!(
                Path::new(name).components().collect::<Vec<_>>().as_slice(),
                [Component::Normal(_)]
            );
            let owned = name.starts_with(&format!("{}_", job.id))
                && single
                && !name.contains('/')
                && !name.contains('\\');
            if !owned {
                return Err(CleanupError::InvalidUpload {
                    job_id: job.id.clone(),
                    name: name.clone(),
                });
            }
            Some(config.uploads_dir().join(name))
        };

        Ok(Self {
            results_dir: config.results_dir().join(&job.id),
            archive: archive_path(config, &job.id),
            upload,
        })
    }

    /// Directorios y archivos presentes, con el tamaño total en bytes.
    pub fn measure(&self) -> Result<(Vec<String>, Vec<String>, u64), CleanupError> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut bytes = 0;

        if self.results_dir.is_dir() {
            bytes += dir_size(&self.results_dir)?;
            dirs.push(display(&self.results_dir));
        }
        for file in std::iter::once(&self.archive).chain(self.upload.as_ref()) {
            if let Ok(meta) = fs::metadata(file) {
                if meta.is_file() {
                    bytes += meta.len();
                    files.push(display(file));
                }
            }
        }
        Ok((dirs, files, bytes))
    }

    /// Borra todo lo que exista. Lo que ya no está no es error.
    pub fn remove(&self) -> Result<(), CleanupError> {
        ignore_missing(fs::remove_dir_all(&self.results_dir), &self.results_dir)?;
        ignore_missing(fs::remove_file(&self.archive), &self.archive)?;
        if let Some(upload) = &self.upload {
            ignore_missing(fs::remove_file(upload), upload)?;
        }
        Ok(())
    }
}

pub fn archive_path(config: &MasterConfig, job_id: &str) -> PathBuf {
    config.results_dir().join(format!("{job_id}_results.zip"))
}

fn ignore_missing(result: io::Result<()>, path: &Path) -> Result<(), CleanupError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CleanupError::Io {
            path: display(path),
            source,
        }),
    }
}

fn dir_size(dir: &Path) -> Result<u64, CleanupError> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));
    let mut total = 0;
    for entry in glob::glob(&pattern)?.flatten() {
        if let Ok(meta) = fs::metadata(&entry) {
            if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Una pasada de limpieza. Con `dry_run` selecciona exactamente lo mismo
/// pero no borra nada ni toca el registro.
pub fn sweep(
    config: &MasterConfig,
    registry: &JobRegistry,
    policy: &RetentionPolicy,
    dry_run: bool,
    now: DateTime<Utc>,
) -> CleanupSummary {
    let candidates = registry.cleanup_candidates(policy, now);
    info!(
        dry_run,
        candidates = candidates.len(),
        "iniciando limpieza de jobs"
    );

    let mut summary = CleanupSummary {
        dry_run,
        started_at: now,
        finished_at: now,
        successful_jobs_processed: 0,
        failed_jobs_processed: 0,
        bytes_freed: 0,
        jobs: Vec::with_capacity(candidates.len()),
        errors: Vec::new(),
    };

    for job in candidates {
        let outcome = clean_job(config, registry, &job, dry_run);
        match job.status {
            JobStatus::Completed => summary.successful_jobs_processed += 1,
            _ => summary.failed_jobs_processed += 1,
        }
        summary.bytes_freed += outcome.bytes_freed;
        if let Some(err) = &outcome.error {
            summary.errors.push(format!("{}: {}", job.id, err));
        }
        summary.jobs.push(outcome);
    }

    summary.finished_at = Utc::now();
    info!(
        dry_run,
        completed = summary.successful_jobs_processed,
        failed = summary.failed_jobs_processed,
        bytes_freed = summary.bytes_freed,
        errors = summary.errors.len(),
        "limpieza terminada"
    );
    summary
}

fn clean_job(
    config: &MasterConfig,
    registry: &JobRegistry,
    job: &Job,
    dry_run: bool,
) -> JobCleanupOutcome {
    let mut outcome = JobCleanupOutcome {
        job_id: job.id.clone(),
        status: job.status,
        completed_at: job.completed_at,
        data_deleted: false,
        directories_deleted: Vec::new(),
        files_deleted: Vec::new(),
        bytes_freed: 0,
        error: None,
    };

    let result = JobPaths::for_job(config, job).and_then(|paths| {
        let (dirs, files, bytes) = paths.measure()?;
        outcome.directories_deleted = dirs;
        outcome.files_deleted = files;
        outcome.bytes_freed = bytes;
        if dry_run {
            debug!(job = %job.id, bytes, "dry run, no se borra nada");
            return Ok(());
        }
        paths.remove()?;
        outcome.data_deleted = true;
        Ok(())
    });

    if let Err(err) = result {
        warn!(job = %job.id, "no se pudo limpiar: {}", err);
        outcome.error = Some(err.to_string());
        outcome.bytes_freed = 0;
        outcome.data_deleted = false;
        return outcome;
    }

    if outcome.data_deleted {
        if let Err(err) = registry.mark_data_cleaned(&job.id, Utc::now()) {
            warn!(job = %job.id, "no se pudo registrar data_cleaned_at: {}", err);
            outcome.error = Some(err.to_string());
        }
    }
    outcome
}

/// Corre la limpieza fuera del runtime async; una pasada a la vez.
pub async fn run_cleanup(state: &AppState, policy: RetentionPolicy, dry_run: bool) -> CleanupSummary {
    let _guard = state.cleanup_lock.lock().await;
    let config = Arc::clone(&state.config);
    let registry = Arc::clone(&state.registry);

    let now = Utc::now();
    let result = tokio::task::spawn_blocking(move || sweep(&config, &registry, &policy, dry_run, now)).await;

    result.unwrap_or_else(|err| {
        error!("la limpieza terminó con pánico: {}", err);
        CleanupSummary {
            dry_run,
            started_at: now,
            finished_at: Utc::now(),
            successful_jobs_processed: 0,
            failed_jobs_processed: 0,
            bytes_freed: 0,
            jobs: Vec::new(),
            errors: vec![format!("cleanup task failed: {err}")],
        }
    })
}

/// Limpieza periódica. La política se vuelve a leer del entorno en cada
/// pasada.
pub async fn cleanup_loop(state: AppState, cancel: CancellationToken) {
    let period = state.config.cleanup_interval;
    info!(interval_secs = period.as_secs(), "limpieza programada activa");

    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("limpieza programada detenida");
                break;
            }
            _ = interval.tick() => {
                let policy = match retention_from_env() {
                    Ok(policy) => policy,
                    Err(err) => {
                        warn!("retención inválida en el entorno, uso la de arranque: {}", err);
                        state.config.retention
                    }
                };
                run_cleanup(&state, policy, false).await;
            }
        }
    }
}
