use crate::state::{lock, AppState};
use std::{
    collections::HashSet,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Un worker muerto se olvida después de este tiempo sin heartbeats.
const FORGET_DEAD_AFTER: Duration = Duration::from_secs(3600);

pub async fn monitor_workers(state: AppState, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("monitor de workers detenido");
                break;
            }
            _ = interval.tick() => {
                check_workers(&state, SystemTime::now()).await;
            }
        }
    }
}

/// Marca muertos a los workers sin heartbeat reciente y avisa a todos los
/// dispatchers para que reencolen lo que esos workers tenían. Los que ya
/// estaban muertos hace más de [`FORGET_DEAD_AFTER`] salen de la tabla.
pub async fn check_workers(state: &AppState, now: SystemTime) -> HashSet<String> {
    let timeout = state.config.heartbeat_timeout;

    // Detectar workers muertos
    let mut dead_workers: HashSet<String> = HashSet::new();
    {
        let mut workers = lock(&state.workers);
        let before = workers.len();
        workers.retain(|_, meta| {
            !(meta.dead
                && now
                    .duration_since(meta.last_heartbeat)
                    .is_ok_and(|elapsed| elapsed > FORGET_DEAD_AFTER))
        });
        if workers.len() < before {
            info!("olvidados {} workers muertos", before - workers.len());
        }

        for (id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
                if elapsed > timeout {
                    meta.dead = true;
                    info!("marcando worker {} como muerto", id);
                    dead_workers.insert(id.clone());
                }
            }
        }
    }

    if dead_workers.is_empty() {
        return dead_workers;
    }

    // sus tareas en vuelo dejan de contar para las métricas
    lock(&state.in_flight).retain(|_, inflight| !dead_workers.contains(&inflight.worker_id));

    for dispatcher in state.live_dispatchers() {
        for worker_id in &dead_workers {
            dispatcher.worker_lost(worker_id).await;
        }
    }

    dead_workers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::registry::JobRegistry;
    use crate::state::WorkerMeta;
    use common::ResourceSpec;

    fn state(dir: &tempfile::TempDir) -> AppState {
        let config = MasterConfig::with_data_dir(dir.path());
        let registry = JobRegistry::open(config.store_path()).unwrap();
        AppState::new(config, registry)
    }

    #[tokio::test]
    async fn workers_muertos_hace_rato_se_olvidan() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let now = SystemTime::now();

        {
            let mut workers = lock(&state.workers);
            let mut alive = WorkerMeta::new("a".into(), ResourceSpec::new(1, 1, 1));
            alive.last_heartbeat = now;
            workers.insert("alive".into(), alive);

            let mut recent = WorkerMeta::new("b".into(), ResourceSpec::new(1, 1, 1));
            recent.last_heartbeat = now - Duration::from_secs(60);
            workers.insert("recent".into(), recent);

            let mut old = WorkerMeta::new("c".into(), ResourceSpec::new(1, 1, 1));
            old.last_heartbeat = now - FORGET_DEAD_AFTER - Duration::from_secs(1);
            old.dead = true;
            workers.insert("old".into(), old);
        }

        let dead = check_workers(&state, now).await;
        assert_eq!(dead, HashSet::from(["recent".to_string()]));

        let workers = lock(&state.workers);
        assert!(!workers.contains_key("old"));
        assert!(workers["recent"].dead);
        assert!(!workers["alive"].dead);
    }
}
