use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::BuildError;
use serde_json::json;
use tracing::error;

use crate::registry::RegistryError;

/// Error de los handlers HTTP. Se serializa como `{error, code}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    /// El recurso existe pero todavía no está listo (p. ej. resultados)
    #[error("{0}")]
    NotReady(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<BuildError> for AppError {
    fn from(err: BuildError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => AppError::NotFound(format!("job {id} not found")),
            RegistryError::NotReady(msg) => AppError::NotReady(msg),
            RegistryError::Conflict(msg) => AppError::Conflict(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            // resultados no disponibles también son 404 para el cliente
            AppError::NotReady(msg) => (StatusCode::NOT_FOUND, "NOT_READY", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            AppError::Internal(msg) => {
                error!(error = %msg, "error interno");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}
