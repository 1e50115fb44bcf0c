use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use common::cleanup::{
    retention_days, retention_hours, DEFAULT_FAILED_RETENTION_HOURS, DEFAULT_SUCCESS_RETENTION_DAYS,
};
use common::RetentionPolicy;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Configuración del master, leída de variables de entorno.
///
/// | Variable                        | Default        |
/// |---------------------------------|----------------|
/// | `HOST`                          | `0.0.0.0`      |
/// | `PORT`                          | `8080`         |
/// | `EEMT_DATA_DIR`                 | `./data`       |
/// | `SUCCESS_RETENTION_DAYS`        | `7`            |
/// | `FAILED_RETENTION_HOURS`        | `12`           |
/// | `CLEANUP_ENABLED`               | `true`         |
/// | `CLEANUP_INTERVAL_SECS`         | `3600`         |
/// | `MAX_TASK_RETRIES`              | `3`            |
/// | `MAX_INFRA_RETRIES`             | `10`           |
/// | `TASK_TIMEOUT_SECS`             | `21600`        |
/// | `WORKER_HEARTBEAT_TIMEOUT_SECS` | `20`           |
/// | `RASTER_PROCESSOR`              | `eemt-raster`  |
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub retention: RetentionPolicy,
    pub cleanup_enabled: bool,
    pub cleanup_interval: Duration,
    pub limits: RetryLimits,
    pub task_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub processor: String,
}

/// Presupuestos de reintento: fallas de la tarea vs. caídas de worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    pub max_task_retries: u32,
    pub max_infra_retries: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_task_retries: 3,
            max_infra_retries: 10,
        }
    }
}

impl MasterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = PathBuf::from(
            std::env::var("EEMT_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
        );

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080)?,
            data_dir,
            retention: retention_from_env()?,
            cleanup_enabled: env_bool("CLEANUP_ENABLED", true)?,
            cleanup_interval: Duration::from_secs(env_or("CLEANUP_INTERVAL_SECS", 3600)?),
            limits: RetryLimits {
                max_task_retries: env_or("MAX_TASK_RETRIES", 3)?,
                max_infra_retries: env_or("MAX_INFRA_RETRIES", 10)?,
            },
            task_timeout: Duration::from_secs(env_or("TASK_TIMEOUT_SECS", 6 * 3600)?),
            heartbeat_timeout: Duration::from_secs(env_or("WORKER_HEARTBEAT_TIMEOUT_SECS", 20)?),
            processor: std::env::var("RASTER_PROCESSOR")
                .unwrap_or_else(|_| common::builder::DEFAULT_PROCESSOR.to_string()),
        })
    }

    /// Config para tests / uso embebido con un directorio de datos dado.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: data_dir.into(),
            retention: RetentionPolicy::default(),
            cleanup_enabled: false,
            cleanup_interval: Duration::from_secs(3600),
            limits: RetryLimits::default(),
            task_timeout: Duration::from_secs(6 * 3600),
            heartbeat_timeout: Duration::from_secs(20),
            processor: common::builder::DEFAULT_PROCESSOR.to_string(),
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }
}

/// Se vuelve a leer en cada pasada programada de limpieza.
pub fn retention_from_env() -> Result<RetentionPolicy, ConfigError> {
    retention_from(
        std::env::var("SUCCESS_RETENTION_DAYS").ok(),
        std::env::var("FAILED_RETENTION_HOURS").ok(),
    )
}

fn retention_from(days: Option<String>, hours: Option<String>) -> Result<RetentionPolicy, ConfigError> {
    Ok(RetentionPolicy {
        success_retention: retention_span(
            "SUCCESS_RETENTION_DAYS",
            days,
            DEFAULT_SUCCESS_RETENTION_DAYS,
            retention_days,
        )?,
        failed_retention: retention_span(
            "FAILED_RETENTION_HOURS",
            hours,
            DEFAULT_FAILED_RETENTION_HOURS,
            retention_hours,
        )?,
    })
}

/// Negativos o valores que no entran en un `chrono::Duration` son inválidos.
fn retention_span(
    var: &'static str,
    raw: Option<String>,
    default: i64,
    to_span: fn(i64) -> Option<chrono::Duration>,
) -> Result<chrono::Duration, ConfigError> {
    let amount = match &raw {
        Some(value) => value.trim().parse().ok(),
        None => Some(default),
    };
    amount
        .and_then(to_span)
        .ok_or_else(|| ConfigError::Invalid {
            var,
            value: raw.unwrap_or_else(|| default.to_string()),
        })
}

fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

fn env_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { var, value }),
        },
        Err(_) => Ok(default),
    }
}
