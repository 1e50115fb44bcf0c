use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobStatus};

pub const DEFAULT_SUCCESS_RETENTION_DAYS: i64 = 7;
pub const DEFAULT_FAILED_RETENTION_HOURS: i64 = 12;

/// Cuánto tiempo se conservan en disco los datos de un job terminado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub success_retention: Duration,
    pub failed_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            success_retention: Duration::days(DEFAULT_SUCCESS_RETENTION_DAYS),
            failed_retention: Duration::hours(DEFAULT_FAILED_RETENTION_HOURS),
        }
    }
}

/// Días de retención como [`Duration`]; `None` si es negativo o no entra.
pub fn retention_days(days: i64) -> Option<Duration> {
    if days < 0 {
        return None;
    }
    Duration::try_days(days)
}

/// Horas de retención como [`Duration`]; `None` si es negativo o no entra.
pub fn retention_hours(hours: i64) -> Option<Duration> {
    if hours < 0 {
        return None;
    }
    Duration::try_hours(hours)
}

impl RetentionPolicy {
    /// `None` si alguno de los dos valores es negativo o fuera de rango.
    pub fn try_new(success_days: i64, failed_hours: i64) -> Option<Self> {
        Some(Self {
            success_retention: retention_days(success_days)?,
            failed_retention: retention_hours(failed_hours)?,
        })
    }

    /// Retención que corresponde a un estado; `None` para jobs vivos.
    pub fn retention_for(&self, status: JobStatus) -> Option<Duration> {
        match status {
            JobStatus::Completed => Some(self.success_retention),
            JobStatus::Failed => Some(self.failed_retention),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }
}

/// Pedido de `POST /api/cleanup`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub dry_run: bool,
    pub success_retention_days: Option<i64>,
    pub failed_retention_hours: Option<i64>,
}

/// Lo que pasó con un job durante la limpieza.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCleanupOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub data_deleted: bool,
    pub directories_deleted: Vec<String>,
    pub files_deleted: Vec<String>,
    pub bytes_freed: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub successful_jobs_processed: u32,
    pub failed_jobs_processed: u32,
    pub bytes_freed: u64,
    pub jobs: Vec<JobCleanupOutcome>,
    pub errors: Vec<String>,
}

impl CleanupSummary {
    pub fn selected_ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.job_id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retencion_fuera_de_rango_no_entra() {
        assert_eq!(retention_days(7), Some(Duration::days(7)));
        assert_eq!(retention_hours(0), Some(Duration::zero()));
        assert_eq!(retention_days(-1), None);
        assert_eq!(retention_days(200_000_000_000), None);
        assert_eq!(retention_hours(i64::MAX), None);

        assert_eq!(RetentionPolicy::try_new(7, 12), Some(RetentionPolicy::default()));
        assert_eq!(RetentionPolicy::try_new(200_000_000_000, 12), None);
    }
}
