//! Registro de jobs persistido en un archivo JSON.
//!
//! Las escrituras se serializan con un mutex propio y reescriben el archivo
//! completo (temporal + rename) antes de publicar el cambio en memoria, así
//! que cada update de un job es atómico y no se pierden actualizaciones
//! concurrentes. Las lecturas sólo toman el `RwLock` del mapa y nunca
//! esperan a que termine una escritura a disco.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::iter;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use common::{Job, JobEvent, JobId, JobStatus, RetentionPolicy};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const RESTART_MESSAGE: &str = "master restarted while the job was in progress";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("{0}")]
    NotReady(String),

    #[error("{0}")]
    Conflict(String),

    #[error("job store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job store is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct JobRegistry {
    path: PathBuf,
    jobs: RwLock<HashMap<JobId, Job>>,
    /// Un solo escritor a la vez, durante todo el update incluido el disco
    writer: Mutex<()>,
}

impl JobRegistry {
    /// Abre (o crea) el store. Los jobs que quedaron `pending`/`running`
    /// de una corrida anterior se marcan como fallidos: sus dispatchers
    /// vivían en memoria.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let mut jobs = HashMap::new();

        if path.exists() {
            let raw = fs::read(&path)?;
            let list: Vec<Job> = serde_json::from_slice(&raw)?;
            for job in list {
                jobs.insert(job.id.clone(), job);
            }
        }

        let mut recovered = 0;
        let now = Utc::now();
        for job in jobs.values_mut() {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error_message = Some(RESTART_MESSAGE.to_string());
                job.completed_at = Some(now);
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!("{} jobs interrumpidos marcados como failed", recovered);
        }
        let registry = Self {
            path,
            jobs: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        };
        registry.persist(jobs.values())?;
        info!("registro de jobs abierto con {} jobs", jobs.len());
        *registry.write() = jobs;

        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert(&self, job: Job) -> Result<(), RegistryError> {
        let _writer = self.writer();
        {
            let jobs = self.read();
            if jobs.contains_key(&job.id) {
                return Err(RegistryError::Conflict(format!("job {} already exists", job.id)));
            }
            self.persist(jobs.values().chain(iter::once(&job)))?;
        }
        self.write().insert(job.id.clone(), job);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Job, RegistryError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Jobs más nuevos primero, opcionalmente filtrados por estado.
    pub fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<Job> {
        let mut list: Vec<Job> = self
            .read()
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            list.truncate(limit);
        }
        list
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            counts.insert(status.to_string(), 0);
        }
        for job in self.read().values() {
            *counts.entry(job.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Update atómico de un job. `f` trabaja sobre una copia; si devuelve
    /// error o no cambia nada, el store queda como estaba.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Job, RegistryError>
    where
        F: FnOnce(&mut Job) -> Result<(), RegistryError>,
    {
        let _writer = self.writer();
        {
            let jobs = self.read();
            let current = jobs
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            let mut next = current.clone();
            f(&mut next)?;
            if next == *current {
                return Ok(next);
            }

            // si falla el disco, la memoria queda como estaba
            self.persist(jobs.values().filter(|j| j.id != id).chain(iter::once(&next)))?;
            drop(jobs);
            self.write().insert(id.to_string(), next.clone());
            Ok(next)
        }
    }

    /// Traduce un evento del dispatcher a estado/progreso del job.
    ///
    /// Una vez terminal, el job no cambia más: eventos repetidos o tardíos
    /// se ignoran. El progreso nunca baja.
    pub fn apply_event(&self, id: &str, event: &JobEvent) -> Result<Job, RegistryError> {
        self.update(id, |job| {
            if job.status.is_terminal() {
                debug!(job = %id, ?event, "evento sobre job terminado ignorado");
                return Ok(());
            }

            let now = Utc::now();
            match event {
                JobEvent::Started => {
                    job.status = JobStatus::Running;
                    job.started_at.get_or_insert(now);
                }
                JobEvent::Progress { percent } => {
                    job.progress = job.progress.max((*percent).min(100));
                }
                JobEvent::Completed => {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.started_at.get_or_insert(now);
                    job.completed_at = Some(now);
                    info!(job = %id, "job completado");
                }
                JobEvent::Failed { error } => {
                    job.status = JobStatus::Failed;
                    job.error_message = Some(error.clone());
                    job.completed_at = Some(now);
                    info!(job = %id, "job fallido: {}", error);
                }
            }
            Ok(())
        })
    }

    /// Job listo para descargar resultados.
    pub fn get_completed(&self, id: &str) -> Result<Job, RegistryError> {
        let job = self.get(id)?;
        if job.status != JobStatus::Completed {
            return Err(RegistryError::NotReady(format!(
                "job {id} is {}, results are only available for completed jobs",
                job.status
            )));
        }
        if job.data_cleaned_at.is_some() {
            return Err(RegistryError::NotReady(format!(
                "results of job {id} were removed by the retention cleanup"
            )));
        }
        Ok(job)
    }

    /// Borra la fila. Los jobs todavía activos no se pueden borrar.
    pub fn delete(&self, id: &str) -> Result<Job, RegistryError> {
        let _writer = self.writer();
        {
            let jobs = self.read();
            let job = jobs
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if !job.status.is_terminal() {
                return Err(RegistryError::Conflict(format!(
                    "job {id} is {}, cancel it before deleting",
                    job.status
                )));
            }
            self.persist(jobs.values().filter(|j| j.id != id))?;
        }
        self.write()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn mark_data_cleaned(&self, id: &str, at: DateTime<Utc>) -> Result<Job, RegistryError> {
        self.update(id, |job| {
            job.data_cleaned_at = Some(at);
            Ok(())
        })
    }

    /// Jobs terminados cuya retención venció y cuyos datos siguen en disco.
    ///
    /// Se evalúa contra el estado vivo del registro: un job `pending` o
    /// `running` nunca se selecciona, tenga el `completed_at` que tenga.
    pub fn cleanup_candidates(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<Job> {
        let mut selected: Vec<Job> = self
            .read()
            .values()
            .filter(|job| job.data_cleaned_at.is_none())
            .filter(|job| match (policy.retention_for(job.status), job.completed_at) {
                (Some(retention), Some(completed_at)) => now - completed_at > retention,
                _ => false,
            })
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.completed_at.cmp(&b.completed_at).then_with(|| a.id.cmp(&b.id)));
        selected
    }

    /// `true` si el job existe y no está pending/running en este momento.
    pub fn is_settled(&self, id: &str) -> bool {
        self.read()
            .get(id)
            .is_some_and(|job| job.status.is_terminal())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist<'a>(&self, jobs: impl Iterator<Item = &'a Job>) -> Result<(), RegistryError> {
        let mut list: Vec<&Job> = jobs.collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let raw = serde_json::to_vec_pretty(&list)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
