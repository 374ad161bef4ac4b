#![deny(clippy::all)]

//! The task graph engine.
//!
//! Expands a pipeline configuration against a package graph into a task
//! DAG, validates it, and drives execution in dependency order under a
//! concurrency bound.

mod builder;
mod execute;
mod graph_visualizer;
mod task_definition;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

pub use builder::{BuilderError, EngineBuilder, MissingTaskError};
use convoy_repository::{PackageGraph, PackageName};
use convoy_task_id::TaskId;
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
pub use graph_visualizer::GraphFormat;
use petgraph::Graph;
pub use task_definition::{
    task_log_filename, workspace_relative_log_file, EnvMode, OutputLogsMode, Pipeline,
    TaskDefinition, TaskOutputs, LOG_DIR, TOPOLOGICAL_PIPELINE_DELIMITER,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl From<TaskId<'static>> for TaskNode {
    fn from(value: TaskId<'static>) -> Self {
        Self::Task(value)
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task) => task.fmt(f),
        }
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// The materialized task graph. `Engine<Building>` is mutable while the
/// builder assembles it; sealing produces the immutable `Engine<Built>`
/// that a run executes against.
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: petgraph::graph::NodeIndex,
    task_lookup: HashMap<TaskId<'static>, petgraph::graph::NodeIndex>,
    task_definitions: HashMap<TaskId<'static>, TaskDefinition>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_definitions: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId<'static>) -> petgraph::graph::NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, ());
    }

    pub fn add_definition(
        &mut self,
        task_id: TaskId<'static>,
        definition: TaskDefinition,
    ) -> Option<TaskDefinition> {
        self.task_definitions.insert(task_id, definition)
    }

    pub(crate) fn task_graph_mut(&mut self) -> &mut Graph<TaskNode, ()> {
        &mut self.task_graph
    }

    // Seals the task graph from being mutated
    pub fn seal(self) -> Engine<Built> {
        let Engine {
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
            ..
        } = self;
        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    /// Every task that transitively depends on `task_id`.
    pub fn transitive_dependents(&self, task_id: &TaskId<'static>) -> HashSet<&TaskNode> {
        convoy_graph_utils::transitive_closure(
            &self.task_graph,
            self.task_lookup.get(task_id).copied(),
            petgraph::Direction::Incoming,
        )
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("node index came from iterating the graph")
                })
                .collect(),
        )
    }

    pub fn task_definition(&self, task_id: &TaskId<'static>) -> Option<&TaskDefinition> {
        self.task_definitions.get(task_id)
    }

    pub fn task_definitions(&self) -> &HashMap<TaskId<'static>, TaskDefinition> {
        &self.task_definitions
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.task_graph.node_weights()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.tasks().filter_map(|node| match node {
            TaskNode::Task(task_id) => Some(task_id),
            TaskNode::Root => None,
        })
    }

    pub fn len(&self) -> usize {
        self.task_lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_lookup.is_empty()
    }

    /// Topological waves: tasks grouped by dependency depth, each wave
    /// sorted lexicographically. A scheduling hint, not a constraint — the
    /// walker releases tasks as their individual dependencies finish.
    pub fn topological_waves(&self) -> Vec<Vec<TaskId<'static>>> {
        let mut depths: HashMap<petgraph::graph::NodeIndex, usize> = HashMap::new();
        let sorted = petgraph::algo::toposort(&self.task_graph, None)
            .expect("sealed engines contain no cycles");

        // Dependencies point outward, so walk in reverse topological order
        for index in sorted.into_iter().rev() {
            let depth = self
                .task_graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .map(|dep| depths.get(&dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths.insert(index, depth);
        }

        let mut waves: Vec<Vec<TaskId<'static>>> = Vec::new();
        for (index, depth) in depths {
            let TaskNode::Task(task_id) = &self.task_graph[index] else {
                continue;
            };
            // Depth 0 is the synthetic root
            let wave = depth.saturating_sub(1);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(task_id.clone());
        }
        for wave in &mut waves {
            wave.sort();
        }
        waves
    }

    /// Collects every constraint violation in the graph so the user sees
    /// them together.
    pub fn validate(
        &self,
        package_graph: &PackageGraph,
        concurrency: u32,
    ) -> Result<(), Vec<ValidateError>> {
        let mut validation_errors = Vec::new();
        let mut persistent_count: u32 = 0;

        for node_index in self.task_graph.node_indices() {
            let TaskNode::Task(task_id) = &self.task_graph[node_index] else {
                continue;
            };

            if self
                .task_definitions
                .get(task_id)
                .is_some_and(|def| def.persistent)
            {
                persistent_count += 1;
            }

            for dep_index in self
                .task_graph
                .neighbors_directed(node_index, petgraph::Direction::Outgoing)
            {
                let TaskNode::Task(dep_id) = &self.task_graph[dep_index] else {
                    continue;
                };

                let Some(dep_definition) = self.task_definitions.get(dep_id) else {
                    validation_errors.push(ValidateError::MissingTask {
                        task_id: dep_id.to_string(),
                        package_name: dep_id.package().to_string(),
                    });
                    continue;
                };

                if package_graph
                    .package_json(&PackageName::from(dep_id.package()))
                    .is_none()
                {
                    validation_errors.push(ValidateError::MissingPackageJson {
                        package: dep_id.package().to_string(),
                    });
                    continue;
                }

                if dep_definition.persistent {
                    validation_errors.push(ValidateError::DependencyOnPersistentTask {
                        persistent_task: dep_id.to_string(),
                        dependant: task_id.to_string(),
                    });
                }
            }
        }

        if persistent_count >= concurrency {
            validation_errors.push(ValidateError::PersistentTasksExceedConcurrency {
                persistent_count,
                concurrency,
            });
        }

        match validation_errors.is_empty() {
            true => Ok(()),
            false => Err(validation_errors),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("Cannot find task definition for {task_id} in package {package_name}")]
    MissingTask {
        task_id: String,
        package_name: String,
    },
    #[error("Cannot find package {package}")]
    MissingPackageJson { package: String },
    #[error("\"{persistent_task}\" is a persistent task, \"{dependant}\" cannot depend on it")]
    DependencyOnPersistentTask {
        persistent_task: String,
        dependant: String,
    },
    #[error(
        "You have {persistent_count} persistent tasks but `convoy` is configured for concurrency \
         of {concurrency}. Set --concurrency to at least {}",
        persistent_count + 1
    )]
    PersistentTasksExceedConcurrency {
        persistent_count: u32,
        concurrency: u32,
    },
}
