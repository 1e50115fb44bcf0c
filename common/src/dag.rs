use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;

use crate::error::BuildError;
use crate::task::{Task, TaskCategory};

/// Grafo de tareas. Las aristas nunca vienen del usuario: se infieren
/// comparando rutas de salida de una tarea con rutas de entrada de otra.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    pub tasks: Vec<Task>,
    /// (productor, consumidor) como índices dentro de `tasks`
    pub edges: Vec<(usize, usize)>,
}

impl TaskGraph {
    /// Arma el grafo a partir de la lista de tareas.
    ///
    /// Falla si dos tareas declaran la misma salida, si hay ids repetidos
    /// o si las rutas forman un ciclo.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, BuildError> {
        let mut ids: HashMap<&str, usize> = HashMap::new();
        for (idx, task) in tasks.iter().enumerate() {
            if ids.insert(task.id.as_str(), idx).is_some() {
                return Err(BuildError::invalid(format!("duplicate task id {}", task.id)));
            }
        }

        let mut producer_of: HashMap<&str, usize> = HashMap::new();
        for (idx, task) in tasks.iter().enumerate() {
            for out in &task.outputs {
                if let Some(prev) = producer_of.insert(out.as_str(), idx) {
                    return Err(BuildError::DuplicateProducer {
                        path: out.clone(),
                        first: tasks[prev].id.clone(),
                        second: task.id.clone(),
                    });
                }
            }
        }

        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (idx, task) in tasks.iter().enumerate() {
            for input in &task.inputs {
                if let Some(&producer) = producer_of.get(input.as_str()) {
                    edges.insert((producer, idx));
                }
            }
        }

        let graph = Self {
            tasks,
            edges: edges.into_iter().collect(),
        };
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == task_id)
    }

    /// Índices de las tareas que producen alguna entrada de `idx`.
    pub fn producers_of(&self, idx: usize) -> Vec<usize> {
        self.edges
            .iter()
            .filter(|(_, to)| *to == idx)
            .map(|(from, _)| *from)
            .collect()
    }

    /// Lista de adyacencia productor -> consumidores.
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.tasks.len()];
        for (from, to) in &self.edges {
            out[*from].push(*to);
        }
        out
    }

    /// Entradas que ninguna tarea del grafo produce.
    pub fn external_inputs(&self) -> BTreeSet<String> {
        let produced: BTreeSet<&str> = self
            .tasks
            .iter()
            .flat_map(|t| t.outputs.iter().map(String::as_str))
            .collect();

        self.tasks
            .iter()
            .flat_map(|t| t.inputs.iter())
            .filter(|p| !produced.contains(p.as_str()))
            .cloned()
            .collect()
    }

    /// Cada entrada debe tener productor o existir ya (según `exists`).
    pub fn check_inputs<F>(&self, exists: F) -> Result<(), BuildError>
    where
        F: Fn(&str) -> bool,
    {
        let external = self.external_inputs();
        for task in &self.tasks {
            for input in &task.inputs {
                if external.contains(input) && !exists(input) {
                    return Err(BuildError::UnresolvedInput {
                        task: task.id.clone(),
                        path: input.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn topological_order(&self) -> Result<Vec<usize>, BuildError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.tasks.len()).map(|i| graph.add_node(i)).collect();
        for (from, to) in &self.edges {
            graph.add_edge(nodes[*from], nodes[*to], ());
        }

        toposort(&graph, None)
            .map(|sorted| sorted.into_iter().map(|n| graph[n]).collect())
            .map_err(|cycle| BuildError::Cycle(self.tasks[graph[cycle.node_id()]].id.clone()))
    }

    /// Serializa el grafo en el formato tipo Make que consume el runtime
    /// externo: una estrofa `salidas : entradas` + comando por tarea,
    /// agrupadas por categoría con sus recursos.
    pub fn to_makeflow(&self) -> String {
        let mut groups: BTreeMap<TaskCategory, Vec<&Task>> = BTreeMap::new();
        for task in &self.tasks {
            groups.entry(task.category).or_default().push(task);
        }

        let mut out = String::new();
        for (category, tasks) in groups {
            // write! sobre String no falla
            let res = tasks[0].resources;
            let _ = writeln!(out, "CATEGORY=\"{}\"", category);
            let _ = writeln!(out, "CORES={}", res.cores);
            let _ = writeln!(out, "MEMORY={}", res.memory_mb);
            let _ = writeln!(out, "DISK={}", res.disk_mb);
            out.push('\n');

            for task in tasks {
                let _ = writeln!(out, "{} : {}", task.outputs.join(" "), task.inputs.join(" "));
                let _ = writeln!(out, "\t{}", task.command);
                out.push('\n');
            }
        }
        out
    }
}
