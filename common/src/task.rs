use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::job::JobId;

pub type TaskId = String;

/// Familia de la tarea. Define la cola FIFO en la que espera y el
/// bloque de recursos con el que se serializa el grafo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskCategory {
    SolarDay,
    MonthlyAggregate,
    TopoPrep,
    ClimateFetch,
    EemtCalc,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::SolarDay => "solar-day",
            TaskCategory::MonthlyAggregate => "monthly-aggregate",
            TaskCategory::TopoPrep => "topo-prep",
            TaskCategory::ClimateFetch => "climate-fetch",
            TaskCategory::EemtCalc => "eemt-calc",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recursos que pide una tarea, o que anuncia un worker como capacidad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl ResourceSpec {
    pub fn new(cores: u32, memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            cores,
            memory_mb,
            disk_mb,
        }
    }

    /// `true` si `self` (lo que pide la tarea) cabe en `capacity`.
    pub fn fits_in(&self, capacity: &ResourceSpec) -> bool {
        self.cores <= capacity.cores
            && self.memory_mb <= capacity.memory_mb
            && self.disk_mb <= capacity.disk_mb
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub category: TaskCategory,

    /// Línea de comando ya renderizada para el procesador raster externo
    pub command: String,

    /// Parámetros con nombre que también recibe el procesador
    pub params: BTreeMap<String, String>,

    /// Rutas declaradas de entrada (pueden no existir todavía)
    pub inputs: Vec<String>,
    /// Rutas declaradas de salida
    pub outputs: Vec<String>,

    pub resources: ResourceSpec,
}

/// Lo que recibe un worker cuando el master le asigna trabajo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub job_id: JobId,
    pub task: Task,
    /// Intento actual (1 = primera ejecución)
    pub attempt: u32,
}

/// Resultado de ejecutar una tarea en el worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub exit_code: i32,
    /// stdout/stderr capturado (recortado) para diagnóstico
    pub output: String,
}

impl TaskOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            exit_code: 0,
            output: String::new(),
        }
    }

    /// Adjunta la salida capturada.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            output: output.into(),
        }
    }
}
