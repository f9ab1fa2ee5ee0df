use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::types::WorkflowTask;

/// Dependency graph over a workflow's top-level tasks. Edges point from a
/// dependency to its dependent. Unknown dependency names are ignored here;
/// validation reports them separately.
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new(tasks: &[WorkflowTask]) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for task in tasks {
            let idx = graph.add_node(task.id.clone());
            nodes.insert(task.id.clone(), idx);
        }
        for task in tasks {
            let Some(&to) = nodes.get(&task.id) else {
                continue;
            };
            for dep in &task.depends_on {
                if let Some(&from) = nodes.get(dep) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Self { graph, nodes }
    }

    /// Returns the id of some task on a dependency cycle, if one exists.
    pub fn find_cycle(&self) -> Option<String> {
        match toposort(&self.graph, None) {
            Ok(_) => None,
            Err(cycle) => Some(self.graph[cycle.node_id()].clone()),
        }
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        let Some(&idx) = self.nodes.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Direct dependents of a task.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let Some(&idx) = self.nodes.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Everything downstream of a task, directly or transitively.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let Some(&start) = self.nodes.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Outgoing)
            {
                if seen.insert(self.graph[next].clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Tasks not yet started whose dependencies are all terminal.
    pub fn ready_tasks(
        &self,
        started: &HashSet<String>,
        terminal: &HashSet<String>,
    ) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| !started.contains(*id))
            .filter(|id| {
                self.dependencies_of(id)
                    .iter()
                    .all(|dep| terminal.contains(dep))
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskKind, WorkflowTask};
    use std::collections::HashMap as Map;

    fn task(id: &str, deps: &[&str]) -> WorkflowTask {
        WorkflowTask {
            id: id.to_string(),
            name: id.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            condition: None,
            timeout_ms: None,
            retry: None,
            on_success: Vec::new(),
            on_failure: Vec::new(),
            kind: TaskKind::Shell {
                command: "true".to_string(),
                cwd: None,
                environment: Map::new(),
            },
        }
    }

    #[test]
    fn test_acyclic_graph_has_no_cycle() {
        let graph = DependencyGraph::new(&[task("a", &[]), task("b", &["a"]), task("c", &["b"])]);
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn test_cycle_is_detected_and_named() {
        let graph = DependencyGraph::new(&[task("a", &["c"]), task("b", &["a"]), task("c", &["b"])]);
        let on_cycle = graph.find_cycle().unwrap();
        assert!(["a", "b", "c"].contains(&on_cycle.as_str()));
    }

    #[test]
    fn test_ready_tasks_respects_dependencies() {
        let graph = DependencyGraph::new(&[task("a", &[]), task("b", &["a"]), task("c", &["a"])]);

        let none_done = HashSet::new();
        let mut ready = graph.ready_tasks(&none_done, &none_done);
        ready.sort();
        assert_eq!(ready, vec!["a"]);

        let started = HashSet::from(["a".to_string()]);
        let terminal = HashSet::from(["a".to_string()]);
        let mut ready = graph.ready_tasks(&started, &terminal);
        ready.sort();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::new(&[
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ]);
        let downstream = graph.transitive_dependents("a");
        assert_eq!(
            downstream,
            HashSet::from(["b".to_string(), "c".to_string()])
        );
    }
}
