//! Per-task fingerprints.
//!
//! File hashes are computed once per package before the scheduler starts;
//! task hashes are computed as each task becomes ready, folding in the
//! hashes of its direct dependencies.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock},
};

use convoy_cache::CacheHitMetadata;
use convoy_engine::{EnvMode, TaskDefinition, TaskNode};
use convoy_env::{DetailedMap, EnvironmentVariableMap};
use convoy_hash::{CanonicalEncoder, StableHash};
use convoy_repository::{package_graph::ROOT_PKG_NAME, PackageInfo, PackageName};
use convoy_scm::{FileHashOracle, SCM};
use convoy_task_id::TaskId;
use convoypath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use regex::Regex;
use tracing::debug;

use crate::{
    hash::{FileHashes, TaskHashable},
    opts::RunOpts,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing pipeline entry {0}")]
    MissingPipelineEntry(TaskId<'static>),
    #[error("missing package.json for {0}")]
    MissingPackageJson(String),
    #[error("cannot find package-file hash for {0}")]
    MissingPackageFileHash(String),
    #[error("missing hash for dependent task {0}")]
    MissingDependencyTaskHash(String),
    #[error(transparent)]
    Scm(#[from] convoy_scm::Error),
    #[error(transparent)]
    Env(#[from] convoy_env::Error),
    #[error(transparent)]
    Path(#[from] convoypath::PathError),
}

/// File hashes for every package participating in a run, computed up front
/// and shared read-only by all tasks of that package.
#[derive(Debug, Default)]
pub struct PackageInputsHashes {
    hashes: HashMap<TaskId<'static>, String>,
    expanded_hashes: HashMap<TaskId<'static>, FileHashes>,
}

impl PackageInputsHashes {
    pub fn calculate_file_hashes<'a>(
        scm: &SCM,
        all_tasks: impl Iterator<Item = &'a TaskNode>,
        workspaces: &HashMap<&PackageName, &PackageInfo>,
        task_definitions: &HashMap<TaskId<'static>, TaskDefinition>,
        repo_root: &AbsoluteSystemPath,
        oracle: Option<&dyn FileHashOracle>,
    ) -> Result<PackageInputsHashes, Error> {
        let mut hashes = HashMap::new();
        let mut expanded_hashes = HashMap::new();

        for task in all_tasks {
            let TaskNode::Task(task_id) = task else {
                continue;
            };

            // The root "package" is the whole repository; its state is
            // covered by the global hash
            if task_id.package() == ROOT_PKG_NAME {
                continue;
            }

            let task_definition = task_definitions
                .get(task_id)
                .ok_or_else(|| Error::MissingPipelineEntry(task_id.clone()))?;

            let package_name = PackageName::from(task_id.package());
            let package = workspaces
                .get(&package_name)
                .ok_or_else(|| Error::MissingPackageJson(package_name.to_string()))?;

            let inputs_fingerprint = inputs_fingerprint(&task_definition.inputs);
            let mut hash_object = scm.get_package_file_hashes_with_oracle(
                repo_root,
                package.package_path(),
                &task_definition.inputs,
                &inputs_fingerprint,
                oracle,
            )?;

            if !task_definition.dot_env.is_empty() {
                let absolute_package_path = repo_root.resolve(package.package_path());
                let dot_env_object = scm.hash_existing_of(
                    &absolute_package_path,
                    task_definition
                        .dot_env
                        .iter()
                        .map(|p| p.to_system_path_buf()),
                )?;

                for (key, value) in dot_env_object {
                    hash_object.insert(key, value);
                }
            }

            let file_hashes = FileHashes(hash_object);
            let hash = file_hashes.hash();

            hashes.insert(task_id.clone(), hash);
            expanded_hashes.insert(task_id.clone(), file_hashes);
        }

        Ok(PackageInputsHashes {
            hashes,
            expanded_hashes,
        })
    }

    pub fn hash_for_task<'a>(&'a self, task_id: &TaskId<'a>) -> Option<&'a str> {
        self.hashes.get(task_id).map(String::as_str)
    }

    pub fn expanded<'a>(&'a self, task_id: &TaskId<'a>) -> Option<&'a FileHashes> {
        self.expanded_hashes.get(task_id)
    }
}

// The oracle key must distinguish runs with different input filters.
fn inputs_fingerprint(inputs: &[String]) -> String {
    let mut encoder = CanonicalEncoder::new();
    encoder.write_str_seq(inputs.iter());
    convoy_hash::hash_bytes(&encoder.finish())
}

/// What the run learned about each task, shared between the scheduler, the
/// cache layer, and the run summary.
#[derive(Debug, Default, Clone)]
pub struct TaskHashTracker {
    state: Arc<Mutex<TaskHashTrackerState>>,
}

#[derive(Debug, Default)]
struct TaskHashTrackerState {
    package_task_hashes: HashMap<TaskId<'static>, String>,
    package_task_env_vars: HashMap<TaskId<'static>, DetailedMap>,
    package_task_outputs: HashMap<TaskId<'static>, Vec<AnchoredSystemPathBuf>>,
    package_task_cache: HashMap<TaskId<'static>, Option<CacheHitMetadata>>,
}

impl TaskHashTracker {
    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_hashes
            .get(task_id)
            .cloned()
    }

    pub fn env_vars(&self, task_id: &TaskId) -> Option<DetailedMap> {
        let state = self.state.lock().expect("hash tracker lock poisoned");
        state.package_task_env_vars.get(task_id).map(|detailed| {
            DetailedMap {
                all: detailed.all.clone(),
                by_source: convoy_env::BySource {
                    explicit: detailed.by_source.explicit.clone(),
                    matching: detailed.by_source.matching.clone(),
                },
            }
        })
    }

    pub fn expanded_outputs(&self, task_id: &TaskId) -> Option<Vec<AnchoredSystemPathBuf>> {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_outputs
            .get(task_id)
            .cloned()
    }

    pub fn cache_status(&self, task_id: &TaskId) -> Option<CacheHitMetadata> {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_cache
            .get(task_id)
            .copied()
            .flatten()
    }

    pub fn insert_expanded_outputs(
        &self,
        task_id: TaskId<'static>,
        outputs: Vec<AnchoredSystemPathBuf>,
    ) {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_outputs
            .insert(task_id, outputs);
    }

    pub fn insert_cache_status(&self, task_id: TaskId<'static>, status: Option<CacheHitMetadata>) {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_cache
            .insert(task_id, status);
    }

    fn insert_hash(&self, task_id: TaskId<'static>, env_vars: DetailedMap, hash: String) {
        let mut state = self.state.lock().expect("hash tracker lock poisoned");
        state.package_task_env_vars.insert(task_id.clone(), env_vars);
        state.package_task_hashes.insert(task_id, hash);
    }
}

/// Computes task fingerprints and the child environment each task runs
/// with.
pub struct TaskHasher<'a> {
    package_inputs_hashes: PackageInputsHashes,
    opts: &'a RunOpts,
    env_at_execution_start: &'a EnvironmentVariableMap,
    global_hash: &'a str,
    global_pass_through_env: Option<&'a [String]>,
    task_hash_tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        package_inputs_hashes: PackageInputsHashes,
        opts: &'a RunOpts,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
        global_pass_through_env: Option<&'a [String]>,
    ) -> Self {
        Self {
            package_inputs_hashes,
            opts,
            env_at_execution_start,
            global_hash,
            global_pass_through_env,
            task_hash_tracker: TaskHashTracker::default(),
        }
    }

    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        task_env_mode: EnvMode,
        workspace: &PackageInfo,
        dependency_set: HashSet<&TaskNode>,
    ) -> Result<String, Error> {
        let hash_of_files = self
            .package_inputs_hashes
            .hash_for_task(task_id)
            .ok_or_else(|| Error::MissingPackageFileHash(task_id.to_string()))?;

        // Declared env names, plus anything the command string references
        // when inference is on
        let mut declared_env = task_definition.env.clone();
        if matches!(task_env_mode, EnvMode::Infer) {
            let command = workspace.package_json.scripts.get(task_id.task());
            if let Some(command) = command {
                for referenced in extract_referenced_vars(command) {
                    if !declared_env.contains(&referenced) {
                        declared_env.push(referenced);
                    }
                }
            }
        }

        let resolved_env_map = self.env_at_execution_start.from_wildcards(&declared_env)?;
        let hashable_env_pairs =
            convoy_env::hashable_env_pairs(self.env_at_execution_start, &declared_env)?;

        let env_vars = DetailedMap {
            all: resolved_env_map.clone(),
            by_source: convoy_env::BySource {
                explicit: resolved_env_map,
                matching: EnvironmentVariableMap::default(),
            },
        };

        let outputs = task_definition.outputs.hashable_outputs(task_id);
        let task_dependency_hashes = self.calculate_dependency_hashes(dependency_set)?;

        debug!(
            "task hash env vars for {}: {:?}",
            task_id, hashable_env_pairs
        );

        let task_hashable = TaskHashable {
            global_hash: self.global_hash,
            task_dependency_hashes,
            package_dir: workspace.package_path().to_unix(),
            hash_of_files,
            external_deps_hash: workspace.get_external_deps_hash(),
            task: task_id.task(),
            outputs,
            pass_thru_args: &self.opts.pass_through_args,
            env: &task_definition.env,
            resolved_env_vars: hashable_env_pairs,
            pass_thru_env: task_definition.pass_through_env.as_deref(),
            env_mode: task_env_mode,
            dot_env: &task_definition.dot_env,
        };

        let task_hash = task_hashable.calculate_task_hash();

        self.task_hash_tracker
            .insert_hash(task_id.clone(), env_vars, task_hash.clone());

        Ok(task_hash)
    }

    // Direct dependency hashes only; transitive changes arrive through the
    // direct hashes themselves.
    fn calculate_dependency_hashes(
        &self,
        dependency_set: HashSet<&TaskNode>,
    ) -> Result<Vec<String>, Error> {
        let mut dependency_hash_set = HashSet::new();

        for dependency_task in dependency_set {
            let TaskNode::Task(dependency_task_id) = dependency_task else {
                continue;
            };

            if dependency_task_id.package() == ROOT_PKG_NAME {
                continue;
            }

            let dependency_hash = self
                .task_hash_tracker
                .hash(dependency_task_id)
                .ok_or_else(|| Error::MissingDependencyTaskHash(dependency_task.to_string()))?;
            dependency_hash_set.insert(dependency_hash);
        }

        let mut dependency_hash_list = dependency_hash_set.into_iter().collect::<Vec<_>>();
        dependency_hash_list.sort();

        Ok(dependency_hash_list)
    }

    /// The environment the task's child process runs with, per the task's
    /// env mode.
    pub fn env(
        &self,
        task_id: &TaskId,
        task_env_mode: EnvMode,
        task_definition: &TaskDefinition,
    ) -> Result<EnvironmentVariableMap, Error> {
        match task_env_mode {
            // The full parent environment flows through
            EnvMode::Loose | EnvMode::Infer => Ok(self.env_at_execution_start.clone()),
            EnvMode::Strict => {
                let mut pass_through_env = EnvironmentVariableMap::default();
                let default_env_var_pass_through_map = self
                    .env_at_execution_start
                    .from_wildcards(platform_pass_through_env())?;
                let tracker_env = self
                    .task_hash_tracker
                    .env_vars(task_id)
                    .map(|detailed| detailed.all)
                    .unwrap_or_default();

                pass_through_env.union(&default_env_var_pass_through_map);
                pass_through_env.union(&tracker_env);

                if let Some(global_pass_through) = self.global_pass_through_env {
                    let global_pass_through_map = self
                        .env_at_execution_start
                        .from_wildcards(global_pass_through)?;
                    pass_through_env.union(&global_pass_through_map);
                }

                if let Some(task_pass_through) = &task_definition.pass_through_env {
                    let task_pass_through_map = self
                        .env_at_execution_start
                        .from_wildcards(task_pass_through)?;
                    pass_through_env.union(&task_pass_through_map);
                }

                Ok(pass_through_env)
            }
        }
    }

    pub fn task_hash_tracker(&self) -> TaskHashTracker {
        self.task_hash_tracker.clone()
    }

    /// The file-hash map that went into a task's fingerprint, for the run
    /// summary.
    pub fn expanded_inputs(&self, task_id: &TaskId) -> Option<crate::hash::FileHashes> {
        self.package_inputs_hashes.expanded(task_id).cloned()
    }
}

// Variables the child cannot function without, kept even under strict mode.
fn platform_pass_through_env() -> &'static [&'static str] {
    #[cfg(windows)]
    {
        &[
            "PATH",
            "SYSTEMROOT",
            "PATHEXT",
            "APPDATA",
            "HOMEDRIVE",
            "HOMEPATH",
            "TEMP",
            "TMP",
        ]
    }
    #[cfg(not(windows))]
    {
        &["PATH", "HOME", "SHELL", "TMPDIR"]
    }
}

// Statically visible `$VAR` / `${VAR}` references in a command string.
fn extract_referenced_vars(command: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"\$\{?([A-Z_][A-Z0-9_]*)\}?").expect("valid pattern"));
    pattern
        .captures_iter(command)
        .map(|capture| capture[1].to_string())
        .collect()
}
