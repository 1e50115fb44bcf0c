mod archive;
mod cleanup;
mod config;
mod dispatcher;
mod error;
mod handlers;
mod jobs;
mod monitor;
mod registry;
mod scheduler;
mod state;
mod tasklog;

use crate::config::MasterConfig;
use crate::registry::JobRegistry;
use crate::state::AppState;
use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info")),
        )
        .init();

    let config = MasterConfig::from_env().context("configuración inválida")?;
    info!(
        data_dir = %config.data_dir.display(),
        max_task_retries = config.limits.max_task_retries,
        max_infra_retries = config.limits.max_infra_retries,
        "configuración cargada"
    );

    for dir in [config.uploads_dir(), config.results_dir()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("no se pudo crear {}", dir.display()))?;
    }

    let registry = JobRegistry::open(config.store_path()).context("no se pudo abrir el registro de jobs")?;
    let addr = format!("{}:{}", config.host, config.port);
    let cleanup_enabled = config.cleanup_enabled;
    let state = AppState::new(config, registry);

    // router HTTP
    let app = handlers::build_router(state.clone());

    let cancel = CancellationToken::new();

    // monitor de heartbeats en segundo plano
    let monitor = tokio::spawn(monitor::monitor_workers(state.clone(), cancel.clone()));

    let cleanup = cleanup_enabled
        .then(|| tokio::spawn(cleanup::cleanup_loop(state.clone(), cancel.clone())));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("error del servidor HTTP")?;

    info!("apagando tareas de fondo");
    cancel.cancel();
    let _ = monitor.await;
    if let Some(cleanup) = cleanup {
        let _ = cleanup.await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("no se pudo escuchar ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    info!("señal de apagado recibida");
}
