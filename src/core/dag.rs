//! Dependency graph over task records.
//!
//! The graph stores tasks as petgraph nodes with edges pointing from a
//! dependency to its dependent. Node indices follow insertion order, which
//! is the deterministic tie-break for every ordering this module produces.

use crate::core::task::{TaskId, TaskRecord};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// A set of tasks that may run side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLevel {
    /// 0-based level index.
    pub index: usize,
    /// Member tasks in insertion order.
    pub task_ids: Vec<TaskId>,
    /// Longest member duration; members run in parallel.
    pub duration_minutes: u64,
}

impl ExecutionLevel {
    pub fn parallel_count(&self) -> usize {
        self.task_ids.len()
    }
}

/// Longest duration-weighted chain through the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalPath {
    pub tasks: Vec<TaskId>,
    pub total_duration: u64,
}

/// A dependency id that names no registered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDependency {
    pub task: TaskId,
    pub dependency: TaskId,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// The task dependency graph.
pub struct DependencyGraph {
    /// Nodes are tasks, edges run dependency -> dependent.
    graph: DiGraph<TaskRecord, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Declared dependencies not (yet) registered, keyed by the missing id.
    unresolved: HashMap<TaskId, Vec<NodeIndex>>,
    /// Number of resolved dependencies per task.
    in_degree: HashMap<NodeIndex, usize>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            unresolved: HashMap::new(),
            in_degree: HashMap::new(),
        }
    }

    /// Register a task and its dependency edges.
    ///
    /// Dependencies that name tasks registered later are connected when
    /// those tasks arrive.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTask` if the id is already registered.
    pub fn add_task(&mut self, task: TaskRecord) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }

        let id = task.id.clone();
        let deps = task.dependencies.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);
        self.in_degree.insert(index, 0);

        for dep in deps {
            match self.task_index.get(&dep) {
                Some(&dep_index) => self.connect(dep_index, index),
                None => self.unresolved.entry(dep).or_default().push(index),
            }
        }

        if let Some(waiting) = self.unresolved.remove(&id) {
            for dependent in waiting {
                self.connect(index, dependent);
            }
        }

        debug!(task = %id, "registered task in dependency graph");
        Ok(index)
    }

    fn connect(&mut self, from: NodeIndex, to: NodeIndex) {
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
            *self.in_degree.entry(to).or_insert(0) += 1;
        }
    }

    /// Remove every task and edge.
    pub fn clear(&mut self) {
        self.graph.clear();
        self.task_index.clear();
        self.unresolved.clear();
        self.in_degree.clear();
    }

    /// Rebuild the graph from scratch and validate it.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTask` for repeated ids and
    /// `Error::CircularDependency` if the dependency relation has a cycle.
    pub fn build_graph(&mut self, tasks: &[TaskRecord]) -> Result<()> {
        self.clear();
        for task in tasks {
            self.add_task(task.clone())?;
        }

        if let Some(cycle) = self.find_cycle() {
            warn!(cycle = ?cycle, "dependency cycle detected");
            self.clear();
            return Err(Error::CircularDependency { cycle });
        }

        let missing = self.validate_dependencies();
        if !missing.is_empty() {
            warn!(count = missing.len(), "tasks reference unknown dependencies");
        }
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of resolved dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&TaskRecord> {
        self.graph.node_weights().collect()
    }

    /// Number of registered tasks the given task waits on.
    pub fn in_degree(&self, id: &TaskId) -> Option<usize> {
        let index = self.task_index.get(id)?;
        self.in_degree.get(index).copied()
    }

    /// Resolved dependency nodes of `index` in declaration order.
    fn dependency_nodes(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph[index]
            .dependencies
            .iter()
            .filter_map(|dep| self.task_index.get(dep).copied())
            .collect()
    }

    /// Dependent nodes of `index` in insertion order.
    fn dependent_nodes(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        nodes.sort();
        nodes
    }

    // ========== Validation ==========

    /// Check the depends-on relation for a cycle.
    pub fn has_circular_dependency(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Three-color DFS over the depends-on relation.
    ///
    /// Returns the cycle as a path that starts and ends on the same task,
    /// following depends-on edges. Unknown dependency ids are leaves.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color = vec![Color::White; self.graph.node_count()];

        for root in self.graph.node_indices() {
            if color[root.index()] != Color::White {
                continue;
            }

            // Each frame holds a node and the position of its next dependency.
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
            color[root.index()] = Color::Gray;
            stack.push((root, self.dependency_nodes(root), 0));

            while let Some((node, deps, pos)) = stack.last_mut() {
                if *pos < deps.len() {
                    let next = deps[*pos];
                    *pos += 1;
                    match color[next.index()] {
                        Color::White => {
                            color[next.index()] = Color::Gray;
                            let next_deps = self.dependency_nodes(next);
                            stack.push((next, next_deps, 0));
                        }
                        Color::Gray => {
                            let start = stack
                                .iter()
                                .position(|(n, _, _)| *n == next)
                                .unwrap_or(0);
                            let mut cycle: Vec<TaskId> = stack[start..]
                                .iter()
                                .map(|(n, _, _)| self.graph[*n].id.clone())
                                .collect();
                            cycle.push(self.graph[next].id.clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node.index()] = Color::Black;
                    stack.pop();
                }
            }
        }

        None
    }

    /// Report every dependency id that names no registered task.
    pub fn validate_dependencies(&self) -> Vec<MissingDependency> {
        self.graph
            .node_weights()
            .flat_map(|task| {
                task.dependencies
                    .iter()
                    .filter(|dep| !self.task_index.contains_key(*dep))
                    .map(|dep| MissingDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    })
            })
            .collect()
    }

    fn cycle_error(&self) -> Error {
        Error::CircularDependency {
            cycle: self.find_cycle().unwrap_or_default(),
        }
    }

    // ========== Ordering ==========

    /// Kahn's algorithm; among available tasks the earliest inserted wins.
    ///
    /// # Errors
    /// Returns `Error::CircularDependency` if not every task can be ordered.
    pub fn topological_sort(&self) -> Result<Vec<TaskId>> {
        Ok(self
            .topological_nodes()?
            .into_iter()
            .map(|index| self.graph[index].id.clone())
            .collect())
    }

    fn topological_nodes(&self) -> Result<Vec<NodeIndex>> {
        let mut remaining: HashMap<NodeIndex, usize> = self.in_degree.clone();
        let mut available: BTreeSet<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| remaining.get(index).copied().unwrap_or(0) == 0)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(index) = available.pop_first() {
            order.push(index);
            for dependent in self.dependent_nodes(index) {
                if let Some(degree) = remaining.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        available.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(self.cycle_error());
        }
        Ok(order)
    }

    /// Group tasks into levels whose dependencies all sit in earlier levels.
    ///
    /// # Errors
    /// Returns `Error::CircularDependency` if some task can never be peeled.
    pub fn get_execution_levels(&self) -> Result<Vec<ExecutionLevel>> {
        let mut remaining: HashMap<NodeIndex, usize> = self.in_degree.clone();
        let mut processed: HashSet<NodeIndex> = HashSet::new();
        let mut levels = Vec::new();

        while processed.len() < self.graph.node_count() {
            let current: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|index| {
                    !processed.contains(index)
                        && remaining.get(index).copied().unwrap_or(0) == 0
                })
                .collect();

            if current.is_empty() {
                return Err(self.cycle_error());
            }

            for &index in &current {
                processed.insert(index);
                for dependent in self.dependent_nodes(index) {
                    if let Some(degree) = remaining.get_mut(&dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            let duration_minutes = current
                .iter()
                .map(|&index| u64::from(self.graph[index].duration_minutes))
                .max()
                .unwrap_or(0);

            levels.push(ExecutionLevel {
                index: levels.len(),
                task_ids: current
                    .iter()
                    .map(|&index| self.graph[index].id.clone())
                    .collect(),
                duration_minutes,
            });
        }

        Ok(levels)
    }

    /// Longest duration-weighted path, by dynamic programming over the
    /// topological order. Ties go to the task earliest in that order.
    pub fn get_critical_path(&self) -> Result<CriticalPath> {
        let order = self.topological_nodes()?;
        if order.is_empty() {
            return Ok(CriticalPath::default());
        }

        let position: HashMap<NodeIndex, usize> =
            order.iter().enumerate().map(|(pos, &n)| (n, pos)).collect();
        let mut distance: HashMap<NodeIndex, u64> = HashMap::new();
        let mut predecessor: HashMap<NodeIndex, NodeIndex> = HashMap::new();

        for &index in &order {
            let mut deps = self.dependency_nodes(index);
            deps.sort_by_key(|dep| position[dep]);

            let mut best: Option<(NodeIndex, u64)> = None;
            for dep in deps {
                let dist = distance[&dep];
                if best.map_or(true, |(_, current)| dist > current) {
                    best = Some((dep, dist));
                }
            }

            let own = u64::from(self.graph[index].duration_minutes);
            match best {
                Some((dep, dist)) => {
                    predecessor.insert(index, dep);
                    distance.insert(index, dist + own);
                }
                None => {
                    distance.insert(index, own);
                }
            }
        }

        let mut end = order[0];
        for &index in &order {
            if distance[&index] > distance[&end] {
                end = index;
            }
        }

        let total_duration = distance[&end];
        let mut path = vec![end];
        while let Some(&prev) = predecessor.get(path.last().unwrap_or(&end)) {
            path.push(prev);
        }
        path.reverse();

        Ok(CriticalPath {
            tasks: path
                .into_iter()
                .map(|index| self.graph[index].id.clone())
                .collect(),
            total_duration,
        })
    }

    // ========== Lookups ==========

    /// Tasks the given task depends on.
    ///
    /// Direct lookup returns the declared ids, including unknown ones.
    /// The recursive form walks the transitive closure with an explicit
    /// stack, in discovery order.
    pub fn get_dependencies(&self, id: &TaskId, recursive: bool) -> Vec<TaskId> {
        let Some(task) = self.get_task(id) else {
            return Vec::new();
        };
        if !recursive {
            return task.dependencies.clone();
        }

        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut result = Vec::new();
        let mut stack: Vec<TaskId> = task.dependencies.iter().rev().cloned().collect();

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(record) = self.get_task(&current) {
                stack.extend(record.dependencies.iter().rev().cloned());
            }
            result.push(current);
        }
        result
    }

    /// Tasks that depend on the given task, directly or transitively.
    pub fn get_dependents(&self, id: &TaskId, recursive: bool) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        if !recursive {
            return self
                .dependent_nodes(start)
                .into_iter()
                .map(|index| self.graph[index].id.clone())
                .collect();
        }

        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut result = Vec::new();
        let mut stack: Vec<NodeIndex> = self.dependent_nodes(start).into_iter().rev().collect();

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            stack.extend(self.dependent_nodes(current).into_iter().rev());
            result.push(self.graph[current].id.clone());
        }
        result
    }

    /// Tasks not yet completed whose full dependency set is completed.
    pub fn get_ready_tasks<'a>(&'a self, completed: &HashSet<TaskId>) -> Vec<&'a TaskRecord> {
        self.graph
            .node_weights()
            .filter(|task| !completed.contains(&task.id))
            .filter(|task| task.dependencies.iter().all(|dep| completed.contains(dep)))
            .collect()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
