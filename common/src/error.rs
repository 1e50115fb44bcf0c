use thiserror::Error;

/// Errores al construir o validar un grafo de tareas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// Pedido mal formado: años invertidos, DEM ausente, extensión inválida...
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("output path {path} is produced by both {first} and {second}")]
    DuplicateProducer {
        path: String,
        first: String,
        second: String,
    },

    #[error("input {path} of task {task} has no producer and does not exist")]
    UnresolvedInput { task: String, path: String },

    #[error("task graph contains a cycle through {0}")]
    Cycle(String),
}

impl BuildError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        BuildError::InvalidRequest(msg.into())
    }
}
