use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use common::ResourceSpec;
use sysinfo::{System, SystemExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Configuración del worker.
///
/// | Variable                   | Default                  |
/// |----------------------------|--------------------------|
/// | `MASTER_URL`               | `http://localhost:8080`  |
/// | `WORKER_CORES`             | cores detectados         |
/// | `WORKER_MEMORY_MB`         | memoria total detectada  |
/// | `WORKER_DISK_MB`           | `51200`                  |
/// | `WORKER_POLL_SECS`         | `2`                      |
/// | `WORKER_HEARTBEAT_SECS`    | `5`                      |
/// | `WORKER_WORK_DIR`          | directorio actual        |
/// | `WORKER_RECONNECT_ATTEMPTS`| `5`                      |
/// | `WORKER_RECONNECT_SECS`    | `10`                     |
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_url: String,
    pub capacity: ResourceSpec,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub work_dir: PathBuf,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        let detected_cores = sys.cpus().len().max(1) as u32;
        // total_memory viene en bytes
        let detected_mem_mb = (sys.total_memory() / (1024 * 1024)).max(1);

        let work_dir = match std::env::var("WORKER_WORK_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        Ok(Self {
            master_url: std::env::var("MASTER_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string())
                .trim_end_matches('/')
                .to_string(),
            capacity: ResourceSpec::new(
                env_or("WORKER_CORES", detected_cores)?,
                env_or("WORKER_MEMORY_MB", detected_mem_mb)?,
                env_or("WORKER_DISK_MB", 51200)?,
            ),
            poll_interval: Duration::from_secs(env_or("WORKER_POLL_SECS", 2)?),
            heartbeat_interval: Duration::from_secs(env_or("WORKER_HEARTBEAT_SECS", 5)?),
            work_dir,
            reconnect_attempts: env_or("WORKER_RECONNECT_ATTEMPTS", 5)?,
            reconnect_delay: Duration::from_secs(env_or("WORKER_RECONNECT_SECS", 10)?),
        })
    }
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
