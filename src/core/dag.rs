//! Task graph: the validated, shape-frozen DAG of sub-tasks for one run.
//!
//! The graph is built once from a planner decomposition. Afterwards its
//! nodes and edges never change; only node state and attempt history do.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::core::plan::{Decomposition, Edge};
use crate::core::task::{Artifact, FailureReason, SubTask, SubTaskId, SubTaskState};
use crate::error::PlanningError;

/// Serializable form of a graph: every node with its state and attempt
/// history, plus the edge list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<SubTask>,
    pub edges: Vec<Edge>,
}

/// Directed acyclic graph of sub-tasks with producer -> consumer edges.
pub struct TaskGraph {
    graph: DiGraph<SubTask, ()>,
    index: HashMap<SubTaskId, NodeIndex>,
    /// Topological order, ties broken by creation order.
    topo: Vec<NodeIndex>,
}

impl TaskGraph {
    /// Build and validate a graph from a planner decomposition.
    ///
    /// Edges are the union of the declared edges and every sub-task's input
    /// references. Sub-tasks without dependencies start `Ready`, the rest
    /// `Pending`. When the planner flagged no sub-task as output-bearing,
    /// every sub-task is, so upstream work lands in the output as
    /// supporting material.
    ///
    /// # Errors
    /// Returns the first structural problem found: empty plan, duplicate
    /// ids, self-dependencies, dangling references, or a cycle.
    pub fn build(decomposition: Decomposition) -> Result<Self, PlanningError> {
        Self::build_with_limit(decomposition, None)
    }

    /// Like [`TaskGraph::build`], additionally rejecting plans with more
    /// than `max_steps` sub-tasks.
    pub fn build_with_limit(
        decomposition: Decomposition,
        max_steps: Option<usize>,
    ) -> Result<Self, PlanningError> {
        let Decomposition {
            subtasks, edges, ..
        } = decomposition;

        if subtasks.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }
        if let Some(max) = max_steps {
            if subtasks.len() > max {
                return Err(PlanningError::TooManySteps {
                    count: subtasks.len(),
                    max,
                });
            }
        }

        let mut all_edges = Vec::new();
        for planned in &subtasks {
            for input in &planned.inputs {
                all_edges.push(Edge {
                    from: input.clone(),
                    to: planned.id.clone(),
                });
            }
        }
        all_edges.extend(edges);

        let nodes = subtasks
            .into_iter()
            .enumerate()
            .map(|(seq, planned)| SubTask::from_plan(planned, seq))
            .collect();

        let mut graph = Self::assemble(nodes, all_edges)?;

        let any_output = graph.graph.node_weights().any(SubTask::is_output_bearing);
        let indices: Vec<NodeIndex> = graph.graph.node_indices().collect();
        for index in indices {
            let has_deps = graph
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .next()
                .is_some();
            let task = &mut graph.graph[index];
            if !any_output {
                task.set_output_bearing(true);
            }
            if !has_deps {
                task.mark_ready();
            }
        }

        Ok(graph)
    }

    /// Rebuild a graph from a snapshot, keeping every node's state.
    ///
    /// The structure is validated again so a corrupted snapshot cannot
    /// produce a graph the scheduler would mis-handle.
    pub fn restore(snapshot: GraphSnapshot) -> Result<Self, PlanningError> {
        if snapshot.nodes.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }
        let mut nodes = snapshot.nodes;
        nodes.sort_by_key(SubTask::created_seq);
        Self::assemble(nodes, snapshot.edges)
    }

    fn assemble(nodes: Vec<SubTask>, edges: Vec<Edge>) -> Result<Self, PlanningError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in nodes {
            let id = node.id().clone();
            if index.contains_key(&id) {
                return Err(PlanningError::DuplicateSubTask { id });
            }
            let node_index = graph.add_node(node);
            index.insert(id, node_index);
        }

        for edge in edges {
            if edge.from == edge.to {
                return Err(PlanningError::SelfDependency { id: edge.to });
            }
            let to = *index.get(&edge.to).ok_or_else(|| PlanningError::DanglingReference {
                from: edge.from.clone(),
                to: edge.to.clone(),
            })?;
            let from = *index.get(&edge.from).ok_or_else(|| PlanningError::DanglingReference {
                from: edge.to.clone(),
                to: edge.from.clone(),
            })?;
            graph.update_edge(from, to, ());
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(PlanningError::CyclicDependency {
                node: graph[cycle.node_id()].id().clone(),
            });
        }

        let topo = stable_topological_order(&graph);
        let mut depths: HashMap<NodeIndex, usize> = HashMap::new();
        for &node in &topo {
            let depth = graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| depths.get(&dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths.insert(node, depth);
        }
        for (node, depth) in depths {
            graph[node].set_depth(depth);
        }

        Ok(Self { graph, index, topo })
    }

    // ========== Structural queries ==========

    pub fn get(&self, id: &SubTaskId) -> Option<&SubTask> {
        self.index.get(id).map(|&i| &self.graph[i])
    }

    pub(crate) fn get_mut(&mut self, id: &SubTaskId) -> Option<&mut SubTask> {
        match self.index.get(id) {
            Some(&i) => self.graph.node_weight_mut(i),
            None => None,
        }
    }

    pub fn contains(&self, id: &SubTaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Sub-tasks in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &SubTask> {
        self.graph.node_weights()
    }

    /// Every sub-task in topological order. Deterministic for a fixed graph.
    pub fn topological_order(&self) -> Vec<&SubTask> {
        self.topo.iter().map(|&i| &self.graph[i]).collect()
    }

    /// Direct dependencies, in topological order.
    pub fn dependencies(&self, id: &SubTaskId) -> Vec<&SubTask> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents, in topological order.
    pub fn dependents(&self, id: &SubTaskId) -> Vec<&SubTask> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &SubTaskId, direction: Direction) -> Vec<&SubTask> {
        let Some(&index) = self.index.get(id) else {
            return Vec::new();
        };
        let linked: HashSet<NodeIndex> =
            self.graph.neighbors_directed(index, direction).collect();
        self.topo
            .iter()
            .filter(|i| linked.contains(i))
            .map(|&i| &self.graph[i])
            .collect()
    }

    /// Every sub-task that transitively depends on `id`, in topological order.
    pub fn descendants(&self, id: &SubTaskId) -> Vec<SubTaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        self.topo
            .iter()
            .filter(|i| seen.contains(i))
            .map(|&i| self.graph[i].id().clone())
            .collect()
    }

    /// Artifacts of the accepted dependencies of `id`, in topological order.
    pub fn upstream_artifacts(&self, id: &SubTaskId) -> Vec<Arc<Artifact>> {
        self.dependencies(id)
            .into_iter()
            .filter_map(|dep| dep.accepted_artifact().cloned())
            .collect()
    }

    // ========== Scheduling queries ==========

    /// Promote every `Pending` sub-task whose dependencies are all `Accepted`
    /// to `Ready`, then return all `Ready` sub-tasks.
    ///
    /// The result is in planner order. Creation sequence numbers are unique,
    /// so no further tie-break applies.
    pub fn ready_nodes(&mut self) -> Vec<SubTaskId> {
        let promotable: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| self.graph[i].state() == &SubTaskState::Pending)
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, Direction::Incoming)
                    .all(|dep| self.graph[dep].state() == &SubTaskState::Accepted)
            })
            .collect();
        for index in promotable {
            self.graph[index].mark_ready();
        }

        let mut ready: Vec<&SubTask> = self
            .graph
            .node_weights()
            .filter(|t| t.state() == &SubTaskState::Ready)
            .collect();
        ready.sort_by_key(|t| t.created_seq());
        ready.into_iter().map(|t| t.id().clone()).collect()
    }

    /// True when every sub-task is `Accepted` or `Failed`.
    pub fn is_complete(&self) -> bool {
        self.graph.node_weights().all(SubTask::is_terminal)
    }

    pub fn all_accepted(&self) -> bool {
        self.graph
            .node_weights()
            .all(|t| t.state() == &SubTaskState::Accepted)
    }

    /// Sub-tasks not yet in a terminal state, in creation order.
    pub fn unfinished(&self) -> Vec<&SubTask> {
        self.graph.node_weights().filter(|t| !t.is_terminal()).collect()
    }

    pub fn count_in(&self, label: &str) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.state().label() == label)
            .count()
    }

    pub fn total_attempts(&self) -> u32 {
        self.graph
            .node_weights()
            .map(|t| t.attempts().len() as u32)
            .sum()
    }

    // ========== State mutation ==========

    /// Mark every non-terminal descendant of `failed` as `Failed` with
    /// `failed` as the upstream cause. Returns the ids that changed.
    pub(crate) fn fail_cascade(&mut self, failed: &SubTaskId) -> Vec<SubTaskId> {
        let mut cascaded = Vec::new();
        for id in self.descendants(failed) {
            if let Some(task) = self.get_mut(&id) {
                if !task.is_terminal() {
                    task.fail(FailureReason::Cascaded {
                        upstream: failed.clone(),
                    });
                    cascaded.push(id);
                }
            }
        }
        cascaded
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let mut edges: Vec<(usize, usize, Edge)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| {
                (
                    self.graph[from].created_seq(),
                    self.graph[to].created_seq(),
                    Edge {
                        from: self.graph[from].id().clone(),
                        to: self.graph[to].id().clone(),
                    },
                )
            })
            .collect();
        edges.sort_by_key(|(from, to, _)| (*from, *to));

        GraphSnapshot {
            nodes: self.graph.node_weights().cloned().collect(),
            edges: edges.into_iter().map(|(_, _, edge)| edge).collect(),
        }
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("subtasks", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}

/// Kahn's algorithm, always taking the earliest-created available node.
fn stable_topological_order(graph: &DiGraph<SubTask, ()>) -> Vec<NodeIndex> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| (i, graph.neighbors_directed(i, Direction::Incoming).count()))
        .collect();
    let mut available: BinaryHeap<Reverse<(usize, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&i, _)| Reverse((graph[i].created_seq(), i)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, node))) = available.pop() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(d) = in_degree.get_mut(&next) {
                *d -= 1;
                if *d == 0 {
                    available.push(Reverse((graph[next].created_seq(), next)));
                }
            }
        }
    }
    order
}
