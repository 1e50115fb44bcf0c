//! Un dispatcher por job: una tarea de tokio que es la única dueña del
//! [`GraphRun`] y procesa los comandos de a uno.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{JobEvent, JobId, ResourceSpec, TaskAssignment, TaskGraph, TaskOutcome, WorkerId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::RetryLimits;
use crate::registry::JobRegistry;
use crate::scheduler::{GraphRun, RunCounts};

/// Cada cuánto se revisan los timeouts de las tareas en curso.
const TICK: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Command {
    Offer {
        worker_id: WorkerId,
        capacity: ResourceSpec,
        reply: oneshot::Sender<Option<TaskAssignment>>,
    },
    Report {
        worker_id: WorkerId,
        task_id: String,
        attempt: u32,
        outcome: TaskOutcome,
        reply: oneshot::Sender<bool>,
    },
    WorkerLost {
        worker_id: WorkerId,
    },
    Cancel,
    Counts {
        reply: oneshot::Sender<RunCounts>,
    },
}

/// Lado del master para hablar con el dispatcher de un job.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    job_id: JobId,
    makeflow: Arc<String>,
    tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Serialización Make del grafo del job.
    pub fn makeflow(&self) -> &str {
        &self.makeflow
    }

    /// `true` cuando el dispatcher ya terminó (grafo completo o fallido).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn offer(&self, worker_id: &str, capacity: ResourceSpec) -> Option<TaskAssignment> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Offer {
            worker_id: worker_id.to_string(),
            capacity,
            reply,
        };
        self.tx.send(cmd).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Devuelve `false` si el reporte fue descartado por viejo.
    pub async fn report(
        &self,
        worker_id: &str,
        task_id: &str,
        attempt: u32,
        outcome: TaskOutcome,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Report {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            attempt,
            outcome,
            reply,
        };
        if self.tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn worker_lost(&self, worker_id: &str) {
        let _ = self
            .tx
            .send(Command::WorkerLost {
                worker_id: worker_id.to_string(),
            })
            .await;
    }

    pub async fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel).await;
    }

    pub async fn counts(&self) -> Option<RunCounts> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Counts { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Arranca el dispatcher del job y devuelve su handle.
pub fn spawn(
    job_id: JobId,
    graph: TaskGraph,
    limits: RetryLimits,
    task_timeout: Duration,
    registry: Arc<JobRegistry>,
) -> DispatcherHandle {
    let (tx, rx) = mpsc::channel(64);
    let makeflow = Arc::new(graph.to_makeflow());

    info!(job = %job_id, tasks = graph.len(), "arrancando dispatcher");
    tokio::spawn(run(job_id.clone(), graph, limits, task_timeout, registry, rx));

    DispatcherHandle {
        job_id,
        makeflow,
        tx,
    }
}

async fn run(
    job_id: JobId,
    graph: TaskGraph,
    limits: RetryLimits,
    task_timeout: Duration,
    registry: Arc<JobRegistry>,
    mut rx: mpsc::Receiver<Command>,
) {
    let (mut graph_run, events) = GraphRun::new(graph, limits);
    relay(&registry, &job_id, events).await;

    let mut tick = tokio::time::interval(TICK);

    while !graph_run.is_finished() {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                handle(&job_id, &mut graph_run, &registry, cmd).await;
            }
            _ = tick.tick() => {
                let events = graph_run.on_tick(SystemTime::now(), task_timeout);
                relay(&registry, &job_id, events).await;
            }
        }
    }

    info!(job = %job_id, counts = ?graph_run.counts(), "dispatcher terminado");
}

async fn handle(job_id: &str, graph_run: &mut GraphRun, registry: &Arc<JobRegistry>, cmd: Command) {
    match cmd {
        Command::Offer {
            worker_id,
            capacity,
            reply,
        } => {
            let (assigned, events) = graph_run.next_for(&worker_id, &capacity, SystemTime::now());
            relay(registry, job_id, events).await;

            let assignment = assigned.map(|(task, attempt)| TaskAssignment {
                job_id: job_id.to_string(),
                task,
                attempt,
            });
            if let Err(Some(lost)) = reply.send(assignment) {
                // el handler ya no escucha: la tarea vuelve a la cola
                warn!(job = %job_id, task = %lost.task.id, "asignación sin receptor");
                let events = graph_run.on_worker_lost(&worker_id);
                relay(registry, job_id, events).await;
            }
        }
        Command::Report {
            worker_id,
            task_id,
            attempt,
            outcome,
            reply,
        } => {
            let (accepted, events) = graph_run.on_report(&task_id, &worker_id, attempt, &outcome);
            relay(registry, job_id, events).await;
            let _ = reply.send(accepted);
        }
        Command::WorkerLost { worker_id } => {
            let events = graph_run.on_worker_lost(&worker_id);
            relay(registry, job_id, events).await;
        }
        Command::Cancel => {
            let events = graph_run.cancel();
            relay(registry, job_id, events).await;
        }
        Command::Counts { reply } => {
            let _ = reply.send(graph_run.counts());
        }
    }
}

/// Aplica los eventos del dispatcher sobre la fila del job.
///
/// La escritura del store es I/O bloqueante: va al pool de `spawn_blocking`
/// y se espera, así los eventos se aplican en orden.
async fn relay(registry: &Arc<JobRegistry>, job_id: &str, events: Vec<JobEvent>) {
    if events.is_empty() {
        return;
    }
    let registry = Arc::clone(registry);
    let id = job_id.to_string();
    let applied = tokio::task::spawn_blocking(move || {
        for event in events {
            debug!(job = %id, ?event, "evento de dispatcher");
            if let Err(err) = registry.apply_event(&id, &event) {
                warn!(job = %id, "no se pudo aplicar {:?}: {}", event, err);
            }
        }
    })
    .await;
    if let Err(err) = applied {
        warn!(job = %job_id, "relay de eventos abortado: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{JobStatus, ResourceSpec, Task, TaskCategory, WorkflowRequest, WorkflowType};
    use std::collections::BTreeMap;

    fn task(id: &str, inputs: &[&str], output: &str) -> Task {
        Task {
            id: id.to_string(),
            category: TaskCategory::MonthlyAggregate,
            command: format!("run {id}"),
            params: BTreeMap::new(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: vec![output.to_string()],
            resources: ResourceSpec::new(1, 10, 10),
        }
    }

    fn setup(dir: &tempfile::TempDir, job_id: &str) -> Arc<JobRegistry> {
        let registry = Arc::new(JobRegistry::open(dir.path().join("jobs.json")).unwrap());
        let req = WorkflowRequest::new(WorkflowType::Sol, "dem.tif");
        registry
            .insert(common::Job::new(job_id.to_string(), req, "dem.tif".into()))
            .unwrap();
        registry
    }

    fn capacity() -> ResourceSpec {
        ResourceSpec::new(4, 4096, 4096)
    }

    #[tokio::test]
    async fn completa_el_job_y_cierra_el_canal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = setup(&dir, "j1");
        let graph = TaskGraph::from_tasks(vec![task("a", &[], "a.out"), task("b", &["a.out"], "b.out")]).unwrap();
        let handle = spawn("j1".into(), graph, RetryLimits::default(), Duration::from_secs(60), registry.clone());
        assert!(handle.makeflow().contains("b.out : a.out"));

        for expected in ["a", "b"] {
            let a = handle.offer("w1", capacity()).await.unwrap();
            assert_eq!(a.task.id, expected);
            assert_eq!(registry.get("j1").unwrap().status, JobStatus::Running);
            assert!(handle.report("w1", &a.task.id, a.attempt, TaskOutcome::succeeded()).await);
        }

        let job = registry.get("j1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);

        // el actor sale del loop al terminar
        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(handle.offer("w1", capacity()).await.is_none());
    }

    #[tokio::test]
    async fn cancelacion_falla_el_job_despues_de_drenar() {
        let dir = tempfile::tempdir().unwrap();
        let registry = setup(&dir, "j2");
        let graph = TaskGraph::from_tasks(vec![task("a", &[], "a.out"), task("b", &[], "b.out")]).unwrap();
        let handle = spawn("j2".into(), graph, RetryLimits::default(), Duration::from_secs(60), registry.clone());

        let a = handle.offer("w1", capacity()).await.unwrap();
        handle.cancel().await;
        assert!(handle.offer("w2", capacity()).await.is_none());
        assert_eq!(registry.get("j2").unwrap().status, JobStatus::Running);

        handle.report("w1", &a.task.id, a.attempt, TaskOutcome::succeeded()).await;
        let job = registry.get("j2").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(crate::scheduler::CANCELLED_MESSAGE));
    }

    #[tokio::test]
    async fn cancelar_la_ultima_tarea_en_curso_no_completa_el_job() {
        let dir = tempfile::tempdir().unwrap();
        let registry = setup(&dir, "j4");
        let graph = TaskGraph::from_tasks(vec![task("a", &[], "a.out")]).unwrap();
        let handle = spawn("j4".into(), graph, RetryLimits::default(), Duration::from_secs(60), registry.clone());

        let a = handle.offer("w1", capacity()).await.unwrap();
        handle.cancel().await;
        assert!(handle.report("w1", &a.task.id, a.attempt, TaskOutcome::succeeded()).await);

        let job = registry.get("j4").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(crate::scheduler::CANCELLED_MESSAGE));
    }

    #[tokio::test]
    async fn reporte_de_otro_worker_se_descarta() {
        let dir = tempfile::tempdir().unwrap();
        let registry = setup(&dir, "j3");
        let graph = TaskGraph::from_tasks(vec![task("a", &[], "a.out")]).unwrap();
        let handle = spawn("j3".into(), graph, RetryLimits::default(), Duration::from_secs(60), registry);

        let a = handle.offer("w1", capacity()).await.unwrap();
        assert!(!handle.report("w2", &a.task.id, a.attempt, TaskOutcome::succeeded()).await);
        assert!(!handle.report("w1", &a.task.id, a.attempt + 1, TaskOutcome::succeeded()).await);

        handle.worker_lost("w1").await;
        let again = handle.offer("w2", capacity()).await.unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(handle.counts().await.unwrap().running, 1);
    }
}
