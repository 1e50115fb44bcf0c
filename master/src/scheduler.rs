//! Máquina de estados de un grafo en ejecución.
//!
//! No hace I/O: recibe eventos discretos (pedido de un worker, reporte,
//! worker caído, tick de timeout, cancelación) y devuelve los [`JobEvent`]
//! que corresponden. El dispatcher es el único dueño de esta estructura.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use common::{
    JobEvent, ResourceSpec, Task, TaskCategory, TaskGraph, TaskId, TaskOutcome, TaskStatus,
    WorkerId,
};
use tracing::{debug, info, warn};

use crate::config::RetryLimits;

pub const CANCELLED_MESSAGE: &str = "Job cancelled by user";

#[derive(Debug, Clone)]
struct Holder {
    worker_id: WorkerId,
    started_at: SystemTime,
}

#[derive(Debug, Clone)]
struct TaskSlot {
    task: Task,
    status: TaskStatus,
    /// Fallas de la propia tarea ya reintentadas
    retries: u32,
    /// Reencolados por caída de worker
    infra_retries: u32,
    /// Número del intento en curso o del último
    attempt: u32,
    /// Productores que todavía no terminaron bien
    unresolved: usize,
    holder: Option<Holder>,
}

/// Conteo de tareas por estado.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunCounts {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct GraphRun {
    slots: Vec<TaskSlot>,
    index: HashMap<TaskId, usize>,
    dependents: Vec<Vec<usize>>,
    /// Cola FIFO por categoría; el número de secuencia ordena entre colas
    ready: BTreeMap<TaskCategory, VecDeque<(u64, usize)>>,
    next_seq: u64,
    succeeded: usize,
    running: usize,
    started: bool,
    /// Motivo por el que el grafo dejó de programar tareas
    abort: Option<String>,
    finished: bool,
    limits: RetryLimits,
}

impl GraphRun {
    pub fn new(graph: TaskGraph, limits: RetryLimits) -> (Self, Vec<JobEvent>) {
        let dependents = graph.dependents();
        let mut unresolved = vec![0usize; graph.len()];
        for (_, to) in &graph.edges {
            unresolved[*to] += 1;
        }

        let slots: Vec<TaskSlot> = graph
            .tasks
            .into_iter()
            .zip(unresolved)
            .map(|(task, unresolved)| TaskSlot {
                task,
                status: TaskStatus::Pending,
                retries: 0,
                infra_retries: 0,
                attempt: 0,
                unresolved,
                holder: None,
            })
            .collect();

        let index = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.task.id.clone(), i))
            .collect();

        let mut run = Self {
            slots,
            index,
            dependents,
            ready: BTreeMap::new(),
            next_seq: 0,
            succeeded: 0,
            running: 0,
            started: false,
            abort: None,
            finished: false,
            limits,
        };

        for idx in 0..run.slots.len() {
            if run.slots[idx].unresolved == 0 {
                run.make_ready(idx);
            }
        }

        let mut events = vec![run.progress_event()];
        if run.slots.is_empty() {
            run.finished = true;
            events.push(JobEvent::Completed);
        }
        (run, events)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[cfg(test)]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }

    pub fn progress(&self) -> u8 {
        if self.slots.is_empty() {
            return 100;
        }
        (self.succeeded * 100 / self.slots.len()) as u8
    }

    #[cfg(test)]
    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.index.get(task_id).map(|&i| self.slots[i].status)
    }

    #[cfg(test)]
    pub fn retries_of(&self, task_id: &str) -> Option<u32> {
        self.index.get(task_id).map(|&i| self.slots[i].retries)
    }

    pub fn counts(&self) -> RunCounts {
        let mut c = RunCounts {
            total: self.slots.len(),
            ..RunCounts::default()
        };
        for slot in &self.slots {
            match slot.status {
                TaskStatus::Pending => c.pending += 1,
                TaskStatus::Ready => c.ready += 1,
                TaskStatus::Running => c.running += 1,
                TaskStatus::Succeeded => c.succeeded += 1,
                TaskStatus::Failed => c.failed += 1,
            }
        }
        c
    }

    /// Ofrece al worker la siguiente tarea lista que entra en su capacidad.
    ///
    /// Devuelve la tarea y el número de intento.
    pub fn next_for(
        &mut self,
        worker_id: &str,
        capacity: &ResourceSpec,
        now: SystemTime,
    ) -> (Option<(Task, u32)>, Vec<JobEvent>) {
        if self.abort.is_some() || self.finished {
            return (None, Vec::new());
        }

        // entre todas las colas, la primera tarea que entra con menor secuencia
        let mut best: Option<(u64, TaskCategory, usize)> = None;
        for (category, queue) in &self.ready {
            let hit = queue
                .iter()
                .enumerate()
                .find(|(_, (_, idx))| self.slots[*idx].task.resources.fits_in(capacity));
            if let Some((pos, (seq, _))) = hit {
                if best.map_or(true, |(s, _, _)| *seq < s) {
                    best = Some((*seq, *category, pos));
                }
            }
        }

        let Some((_, category, pos)) = best else {
            return (None, Vec::new());
        };
        let Some((_, idx)) = self.ready.get_mut(&category).and_then(|q| q.remove(pos)) else {
            return (None, Vec::new());
        };

        let slot = &mut self.slots[idx];
        slot.status = TaskStatus::Running;
        slot.attempt += 1;
        slot.holder = Some(Holder {
            worker_id: worker_id.to_string(),
            started_at: now,
        });
        self.running += 1;

        debug!(
            task = %slot.task.id,
            attempt = slot.attempt,
            worker = %worker_id,
            "tarea pasa a Running"
        );

        let assignment = (slot.task.clone(), slot.attempt);
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(JobEvent::Started);
        }
        events.push(self.progress_event());
        (Some(assignment), events)
    }

    /// Aplica el reporte de un worker. Devuelve `false` si era un reporte
    /// viejo (otro intento, otro worker o la tarea ya no corre).
    pub fn on_report(
        &mut self,
        task_id: &str,
        worker_id: &str,
        attempt: u32,
        outcome: &TaskOutcome,
    ) -> (bool, Vec<JobEvent>) {
        let Some(&idx) = self.index.get(task_id) else {
            return (false, Vec::new());
        };
        let slot = &self.slots[idx];
        let current = slot.status == TaskStatus::Running
            && slot.attempt == attempt
            && slot.holder.as_ref().map(|h| h.worker_id.as_str()) == Some(worker_id);
        if !current {
            debug!(task = %task_id, attempt, worker = %worker_id, "reporte viejo ignorado");
            return (false, Vec::new());
        }

        self.release(idx);

        let mut events = Vec::new();
        if outcome.success {
            self.succeed(idx, &mut events);
        } else {
            let reason = format!(
                "task {} failed with exit code {}: {}",
                task_id,
                outcome.exit_code,
                outcome.output.trim()
            );
            self.fail_attempt(idx, reason, &mut events);
        }
        self.finish_drain(&mut events);
        (true, events)
    }

    /// Un worker dejó de mandar heartbeats: sus tareas vuelven a la cola
    /// sin gastar reintentos de tarea.
    pub fn on_worker_lost(&mut self, worker_id: &str) -> Vec<JobEvent> {
        let held: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.status == TaskStatus::Running
                    && s.holder.as_ref().map(|h| h.worker_id.as_str()) == Some(worker_id)
            })
            .map(|(i, _)| i)
            .collect();

        let mut events = Vec::new();
        for idx in held {
            self.release(idx);

            if self.abort.is_some() {
                self.slots[idx].status = TaskStatus::Failed;
                continue;
            }

            let slot = &mut self.slots[idx];
            slot.infra_retries += 1;
            if slot.infra_retries > self.limits.max_infra_retries {
                let reason = format!(
                    "task {} lost its worker {} times",
                    slot.task.id, slot.infra_retries
                );
                self.fail_final(idx, reason);
            } else {
                info!(
                    task = %slot.task.id,
                    worker = %worker_id,
                    infra_retries = slot.infra_retries,
                    "reencolando tarea por caída del worker"
                );
                self.make_ready(idx);
            }
            events.push(self.progress_event());
        }
        self.finish_drain(&mut events);
        events
    }

    /// Tareas que llevan más de `timeout` corriendo se tratan como falla
    /// (consumen un reintento).
    pub fn on_tick(&mut self, now: SystemTime, timeout: Duration) -> Vec<JobEvent> {
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.status == TaskStatus::Running
                    && s.holder.as_ref().is_some_and(|h| {
                        now.duration_since(h.started_at).unwrap_or_default() > timeout
                    })
            })
            .map(|(i, _)| i)
            .collect();

        let mut events = Vec::new();
        for idx in expired {
            self.release(idx);
            let reason = format!(
                "task {} timed out after {}s",
                self.slots[idx].task.id,
                timeout.as_secs()
            );
            warn!("{}", reason);
            self.fail_attempt(idx, reason, &mut events);
        }
        self.finish_drain(&mut events);
        events
    }

    /// Deja de ofrecer tareas; el job falla cuando drenan las que corren.
    pub fn cancel(&mut self) -> Vec<JobEvent> {
        if self.finished || self.abort.is_some() {
            return Vec::new();
        }
        info!("cancelando grafo, {} tareas en vuelo", self.running);
        self.abort = Some(CANCELLED_MESSAGE.to_string());
        self.ready.clear();

        let mut events = Vec::new();
        self.finish_drain(&mut events);
        events
    }

    fn make_ready(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.status = TaskStatus::Ready;
        self.ready
            .entry(slot.task.category)
            .or_default()
            .push_back((self.next_seq, idx));
        self.next_seq += 1;
    }

    fn release(&mut self, idx: usize) {
        self.slots[idx].holder = None;
        self.running -= 1;
    }

    fn succeed(&mut self, idx: usize, events: &mut Vec<JobEvent>) {
        self.slots[idx].status = TaskStatus::Succeeded;
        self.succeeded += 1;

        if self.abort.is_none() {
            for dep in self.dependents[idx].clone() {
                let slot = &mut self.slots[dep];
                slot.unresolved -= 1;
                if slot.unresolved == 0 && slot.status == TaskStatus::Pending {
                    self.make_ready(dep);
                }
            }
        }

        events.push(self.progress_event());
        // cancelado: aunque todo haya terminado bien, la falla la emite finish_drain
        if self.succeeded == self.slots.len() && !self.finished && self.abort.is_none() {
            info!("todas las tareas del grafo terminaron bien");
            self.finished = true;
            events.push(JobEvent::Completed);
        }
    }

    fn fail_attempt(&mut self, idx: usize, reason: String, events: &mut Vec<JobEvent>) {
        if self.abort.is_some() {
            // grafo abortado: lo que drena no se reintenta
            self.slots[idx].status = TaskStatus::Failed;
            events.push(self.progress_event());
            return;
        }

        let slot = &mut self.slots[idx];
        if slot.retries < self.limits.max_task_retries {
            slot.retries += 1;
            info!(
                task = %slot.task.id,
                retries = slot.retries,
                max = self.limits.max_task_retries,
                "reintentando tarea"
            );
            self.make_ready(idx);
        } else {
            let reason = format!("{} (after {} attempts)", reason, slot.attempt);
            self.fail_final(idx, reason);
        }
        events.push(self.progress_event());
    }

    fn fail_final(&mut self, idx: usize, reason: String) {
        warn!(task = %self.slots[idx].task.id, "tarea en Failed definitivo: {}", reason);
        self.slots[idx].status = TaskStatus::Failed;
        if self.abort.is_none() {
            self.abort = Some(reason);
            self.ready.clear();
        }
    }

    /// Si el grafo está abortado y no queda nada corriendo, emite la falla
    /// (una sola vez).
    fn finish_drain(&mut self, events: &mut Vec<JobEvent>) {
        if self.finished || self.running > 0 {
            return;
        }
        if let Some(error) = &self.abort {
            self.finished = true;
            events.push(JobEvent::Failed {
                error: error.clone(),
            });
        }
    }

    fn progress_event(&self) -> JobEvent {
        JobEvent::Progress {
            percent: self.progress(),
        }
    }
}
