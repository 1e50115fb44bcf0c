mod config;
mod processor;
mod worker;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let config = WorkerConfig::from_env().context("configuración inválida")?;
    info!(
        master = %config.master_url,
        work_dir = %config.work_dir.display(),
        "arrancando worker"
    );

    tokio::select! {
        result = worker::run(config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("worker detenido por señal");
            Ok(())
        }
    }
}
