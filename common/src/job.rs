use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::workflow::{WorkflowRequest, WorkflowType};

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workflow_type: WorkflowType,

    /// Copia del pedido tal como se envió
    pub parameters: WorkflowRequest,

    pub status: JobStatus,
    /// 0..=100, no decrece mientras el job no termina
    pub progress: u8,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Nombre del archivo en `uploads/` (`<job_id>_<original>`)
    pub dem_filename: String,
    pub error_message: Option<String>,

    /// Momento en que la limpieza borró los datos en disco del job
    #[serde(default)]
    pub data_cleaned_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, parameters: WorkflowRequest, dem_filename: String) -> Self {
        Self {
            id,
            workflow_type: parameters.workflow_type,
            parameters,
            status: JobStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            dem_filename,
            error_message: None,
            data_cleaned_at: None,
        }
    }
}

/// Eventos que emite un Dispatcher y que el registro aplica sobre el Job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Arrancó la primera tarea
    Started,
    Progress { percent: u8 },
    Completed,
    Failed { error: String },
}

/// Respuesta de `POST /api/submit-job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: String,
}
