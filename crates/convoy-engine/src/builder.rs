use std::collections::{HashMap, HashSet, VecDeque};

use convoy_repository::{package_graph::ROOT_PKG_NAME, PackageGraph, PackageName, PackageNode};
use convoy_task_id::{TaskId, TaskName};
use itertools::Itertools;

use crate::{Building, Built, Engine, Pipeline, TaskDefinition};

#[derive(Debug, thiserror::Error)]
pub enum MissingTaskError {
    #[error("task `{name}` has no definition and no package defines a matching script")]
    MissingTaskDefinition { name: String },
    #[error("package `{name}` does not exist")]
    MissingPackage { name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error(
        "Could not find the following tasks in project: {}",
        .0.iter().map(|e| e.to_string()).join(", ")
    )]
    MissingTasks(Vec<MissingTaskError>),
    #[error("Could not find package \"{package}\" referenced by task \"{task_id}\"")]
    MissingPackageFromTask { package: String, task_id: String },
    #[error(
        "Could not find \"{task_id}\" in project. Explicit dependencies on package tasks \
         require the task to exist in that package"
    )]
    MissingPackageTask { task_id: String },
    #[error(
        "Root task \"{task_id}\" is not enabled. Add it to the requested tasks to allow it to run"
    )]
    MissingRootTask { task_id: String },
    #[error(transparent)]
    InvalidGraph(#[from] convoy_graph_utils::Error),
}

/// Expands `(pipeline × package graph × requested tasks)` into a sealed
/// [`Engine`].
///
/// A `(package, task)` pair enters the graph when the pipeline defines the
/// task for that package or the package's manifest has a matching script;
/// pairs with neither are silently omitted. Requested tasks that match
/// nothing anywhere fail the build as a group.
pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    pipeline: &'a Pipeline,
    workspaces: Vec<PackageName>,
    tasks: Vec<TaskName<'static>>,
    root_enabled_tasks: HashSet<TaskName<'static>>,
    tasks_only: bool,
    allow_missing_package_task: bool,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(package_graph: &'a PackageGraph, pipeline: &'a Pipeline) -> Self {
        Self {
            package_graph,
            pipeline,
            workspaces: Vec::new(),
            tasks: Vec::new(),
            root_enabled_tasks: HashSet::new(),
            tasks_only: false,
            allow_missing_package_task: false,
        }
    }

    pub fn with_workspaces(mut self, workspaces: Vec<PackageName>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// Root tasks (`//#task`) only run when explicitly enabled; this guards
    /// against a pipeline entry accidentally scheduling work at the root.
    pub fn with_root_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.root_enabled_tasks = tasks
            .into_iter()
            .filter(|name| name.package() == Some(ROOT_PKG_NAME))
            .map(|name| name.into_non_workspace_task())
            .collect();
        self
    }

    /// Restricts the graph to exactly the requested `(package, task)` pairs,
    /// dropping dependency edges that point outside the set.
    pub fn with_tasks_only(mut self, tasks_only: bool) -> Self {
        self.tasks_only = tasks_only;
        self
    }

    /// Downgrades explicit `pkg#task` references to missing tasks from an
    /// error to a silent skip, matching the topological behavior.
    pub fn allow_missing_package_task(mut self) -> Self {
        self.allow_missing_package_task = true;
        self
    }

    fn has_task_definition(&self, task_id: &TaskId) -> bool {
        if self.pipeline.has_entry_for(task_id) {
            return true;
        }
        self.package_graph
            .package_json(&PackageName::from(task_id.package()))
            .is_some_and(|manifest| manifest.scripts.contains_key(task_id.task()))
    }

    fn definition_for(&self, task_id: &TaskId) -> TaskDefinition {
        self.pipeline
            .definition_for(task_id)
            .cloned()
            // The task was admitted on the strength of a package script; it
            // runs with stock settings.
            .unwrap_or_default()
    }

    // The product of the filtered packages and the requested tasks; only
    // tasks in this set may enter the graph under tasks_only.
    fn allowed_tasks(&self) -> Option<HashSet<TaskId<'static>>> {
        self.tasks_only.then(|| {
            self.workspaces
                .iter()
                .cartesian_product(self.tasks.iter())
                .map(|(package, task_name)| {
                    task_name
                        .task_id()
                        .unwrap_or_else(|| TaskId::new(package.as_str(), task_name.task()))
                        .into_owned()
                })
                .collect()
        })
    }

    pub fn build(self) -> Result<Engine<Built>, BuilderError> {
        // No packages match the filter: nothing to do
        if self.workspaces.is_empty() {
            return Ok(Engine::default().seal());
        }

        let mut missing_tasks: HashSet<&TaskName<'static>> = self.tasks.iter().collect();
        let mut traversal_queue: VecDeque<TaskId<'static>> = VecDeque::with_capacity(1);

        for (workspace, task) in self.workspaces.iter().cartesian_product(self.tasks.iter()) {
            let task_id = task
                .task_id()
                .unwrap_or_else(|| TaskId::new(workspace.as_str(), task.task()))
                .into_owned();

            if self.has_task_definition(&task_id) {
                missing_tasks.remove(task);

                // Root tasks only become entry points when explicitly
                // enabled
                if task_id.package() != ROOT_PKG_NAME
                    || self
                        .root_enabled_tasks
                        .contains(&task_id.as_non_workspace_task_name())
                {
                    traversal_queue.push_back(task_id);
                }
            }
        }

        // A task missing from the filtered packages may still exist
        // elsewhere in the repository; only fail for tasks that match
        // nothing anywhere.
        missing_tasks.retain(|task| {
            !self.package_graph.packages().any(|(package, _)| {
                let task_id = task
                    .task_id()
                    .unwrap_or_else(|| TaskId::new(package.as_str(), task.task()));
                self.has_task_definition(&task_id)
            })
        });

        if !missing_tasks.is_empty() {
            let mut missing_tasks = missing_tasks
                .into_iter()
                .map(|task| (task.to_string(), task.package()))
                .collect::<Vec<_>>();
            // Sorted to keep the error deterministic
            missing_tasks.sort_by(|a, b| a.0.cmp(&b.0));

            let errors = missing_tasks
                .into_iter()
                .map(|(name, package)| {
                    let missing_package = package.is_some_and(|package| {
                        self.package_graph
                            .package_info(&PackageName::from(package))
                            .is_none()
                    });
                    if missing_package {
                        MissingTaskError::MissingPackage {
                            name: package.expect("missing package implies qualifier").to_string(),
                        }
                    } else {
                        MissingTaskError::MissingTaskDefinition { name }
                    }
                })
                .collect();
            return Err(BuilderError::MissingTasks(errors));
        }

        let allowed_tasks = self.allowed_tasks();

        let mut visited = HashSet::new();
        let mut engine: Engine<Building> = Engine::default();

        while let Some(task_id) = traversal_queue.pop_front() {
            if task_id.package() == ROOT_PKG_NAME
                && !self
                    .root_enabled_tasks
                    .contains(&task_id.as_non_workspace_task_name())
            {
                return Err(BuilderError::MissingRootTask {
                    task_id: task_id.to_string(),
                });
            }

            if task_id.package() != ROOT_PKG_NAME
                && self
                    .package_graph
                    .package_json(&PackageName::from(task_id.package()))
                    .is_none()
            {
                // A pkg#task reference named a package the graph has never
                // heard of
                return Err(BuilderError::MissingPackageFromTask {
                    package: task_id.package().to_string(),
                    task_id: task_id.to_string(),
                });
            }

            if !visited.insert(task_id.clone()) {
                continue;
            }

            let task_definition = self.definition_for(&task_id);

            let to_task_index = engine.get_index(&task_id);

            let dep_pkgs = self
                .package_graph
                .immediate_dependencies(&PackageNode::Workspace(PackageName::from(
                    task_id.package(),
                )));

            let mut has_deps = false;
            let mut has_topo_deps = false;

            for (topo_dep, dependency_workspace) in task_definition
                .topological_dependencies
                .iter()
                .cartesian_product(dep_pkgs.iter().flatten())
            {
                let PackageNode::Workspace(dependency_workspace) = dependency_workspace else {
                    continue;
                };
                let from_task_id =
                    TaskId::from_static(dependency_workspace.to_string(), topo_dep.task().to_string());
                // Upstream packages without the task are simply not part of
                // this task's frontier
                if !self.has_task_definition(&from_task_id) {
                    continue;
                }
                if let Some(allowed_tasks) = &allowed_tasks {
                    if !allowed_tasks.contains(&from_task_id) {
                        continue;
                    }
                }
                let from_task_index = engine.get_index(&from_task_id);
                has_topo_deps = true;
                engine
                    .task_graph_mut()
                    .add_edge(to_task_index, from_task_index, ());
                traversal_queue.push_back(from_task_id);
            }

            for dep in &task_definition.task_dependencies {
                let from_task_id = dep
                    .task_id()
                    .map(|id| id.into_owned())
                    .unwrap_or_else(|| {
                        TaskId::from_static(task_id.package().to_string(), dep.task().to_string())
                    });

                if !self.has_task_definition(&from_task_id) {
                    if dep.is_package_qualified() && !self.allow_missing_package_task {
                        // Explicit references are held to a higher standard
                        // than topological expansion
                        return Err(BuilderError::MissingPackageTask {
                            task_id: from_task_id.to_string(),
                        });
                    }
                    continue;
                }
                if let Some(allowed_tasks) = &allowed_tasks {
                    if !allowed_tasks.contains(&from_task_id) {
                        continue;
                    }
                }

                has_deps = true;
                let from_task_index = engine.get_index(&from_task_id);
                engine
                    .task_graph_mut()
                    .add_edge(to_task_index, from_task_index, ());
                traversal_queue.push_back(from_task_id);
            }

            engine.add_definition(task_id.clone(), task_definition);
            if !has_deps && !has_topo_deps {
                engine.connect_to_root(&task_id);
            }
        }

        convoy_graph_utils::validate_graph(engine.task_graph_mut())?;

        Ok(engine.seal())
    }
}
