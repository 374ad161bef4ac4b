use std::collections::HashMap;

use convoypath::{AnchoredSystemPath, AnchoredSystemPathBuf, RelativeUnixPathBuf};
use convoy_task_id::{TaskId, TaskName};
use serde::Serialize;

/// Prefix marking a dependency as topological: it expands to the same task
/// in every direct internal dependency package.
pub const TOPOLOGICAL_PIPELINE_DELIMITER: &str = "^";

/// Directory under a package where convoy keeps task logs and bookkeeping.
pub const LOG_DIR: &str = ".convoy";

/// Controls which environment variables a task's child process sees and how
/// the environment is accounted for in the fingerprint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMode {
    /// Declared vars plus vars statically referenced by the command string.
    #[default]
    Infer,
    /// Declared vars are hashed; the child inherits the full environment.
    Loose,
    /// Declared vars are hashed; the child environment is filtered down to
    /// declared names, pass-through names, and a small platform allowlist.
    Strict,
}

impl EnvMode {
    /// Frozen hash code. Never renumber.
    pub fn hash_code(self) -> u8 {
        match self {
            EnvMode::Infer => 0,
            EnvMode::Loose => 1,
            EnvMode::Strict => 2,
        }
    }
}

impl std::fmt::Display for EnvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EnvMode::Infer => "infer",
            EnvMode::Loose => "loose",
            EnvMode::Strict => "strict",
        })
    }
}

/// How much of a task's output makes it to the terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    #[default]
    Full,
    HashOnly,
    NewOnly,
    ErrorsOnly,
    None,
}

impl OutputLogsMode {
    /// Frozen hash code. Never renumber.
    pub fn hash_code(self) -> u8 {
        match self {
            OutputLogsMode::Full => 0,
            OutputLogsMode::HashOnly => 1,
            OutputLogsMode::NewOnly => 2,
            OutputLogsMode::ErrorsOnly => 3,
            OutputLogsMode::None => 4,
        }
    }
}

/// Output glob groups for a task. Leading `!` in raw configuration becomes
/// an exclusion here.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

impl TaskOutputs {
    pub fn from_raw(raw: impl IntoIterator<Item = String>) -> Self {
        let mut outputs = TaskOutputs::default();
        for glob in raw {
            match glob.strip_prefix('!') {
                Some(exclusion) => outputs.exclusions.push(exclusion.to_string()),
                None => outputs.inclusions.push(glob),
            }
        }
        outputs
    }

    /// Globs in sorted order with the task log file folded in, ready for
    /// hashing.
    pub fn hashable_outputs(&self, task_id: &TaskId) -> TaskOutputs {
        let mut inclusions = self.inclusions.clone();
        inclusions.push(format!("{LOG_DIR}/{}", task_log_filename(task_id.task())));
        inclusions.sort();

        let mut exclusions = self.exclusions.clone();
        exclusions.sort();

        TaskOutputs {
            inclusions,
            exclusions,
        }
    }

    /// Hashable outputs rebased onto the repo root.
    pub fn repo_relative_hashable_outputs(
        &self,
        task_id: &TaskId,
        workspace_dir: &AnchoredSystemPath,
    ) -> TaskOutputs {
        let make_glob_repo_relative =
            |glob: &str| format!("{}/{}", workspace_dir.to_unix(), glob);

        let mut inclusions: Vec<_> = self
            .inclusions
            .iter()
            .map(|i| make_glob_repo_relative(i))
            .collect();
        inclusions.push(make_glob_repo_relative(&format!(
            "{LOG_DIR}/{}",
            task_log_filename(task_id.task())
        )));
        inclusions.sort();

        let mut exclusions: Vec<_> = self
            .exclusions
            .iter()
            .map(|e| make_glob_repo_relative(e))
            .collect();
        exclusions.sort();

        TaskOutputs {
            inclusions,
            exclusions,
        }
    }
}

/// The filename of a task's captured log. Task names may contain `:` from
/// script namespacing, which is not universally filesystem-safe.
pub fn task_log_filename(task_name: &str) -> String {
    format!("convoy-{}.log", task_name.replace(':', "$colon$"))
}

/// The package-relative path of a task's log file.
pub fn workspace_relative_log_file(task_name: &str) -> AnchoredSystemPathBuf {
    let log = RelativeUnixPathBuf::new(format!("{LOG_DIR}/{}", task_log_filename(task_name)))
        .expect("log path is relative");
    log.to_system_path_buf()
}

/// A task definition with every configuration layer already applied: the
/// package-level entry has replaced the root-level one, `dependsOn` is split
/// into direct and topological groups, and defaults are filled in. This is
/// the form that feeds both the hasher and the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,

    /// Same-package and explicit `pkg#task` dependencies, sorted.
    pub task_dependencies: Vec<TaskName<'static>>,
    /// `^task` dependencies, sorted; expanded against the package graph by
    /// the engine builder.
    pub topological_dependencies: Vec<TaskName<'static>>,

    /// Input globs; empty means every package file.
    pub inputs: Vec<String>,
    pub output_logs: OutputLogsMode,
    pub persistent: bool,
    pub interactive: bool,

    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
    pub dot_env: Vec<RelativeUnixPathBuf>,
    pub env_mode: Option<EnvMode>,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: TaskOutputs::default(),
            cache: true,
            task_dependencies: Vec::new(),
            topological_dependencies: Vec::new(),
            inputs: Vec::new(),
            output_logs: OutputLogsMode::default(),
            persistent: false,
            interactive: false,
            env: Vec::new(),
            pass_through_env: None,
            dot_env: Vec::new(),
            env_mode: None,
        }
    }
}

impl TaskDefinition {
    /// Splits raw `dependsOn` entries into direct and topological groups.
    pub fn with_depends_on(mut self, depends_on: &[&str]) -> Self {
        for dependency in depends_on {
            if let Some(topological) = dependency.strip_prefix(TOPOLOGICAL_PIPELINE_DELIMITER) {
                self.topological_dependencies
                    .push(TaskName::from(topological.to_string()));
            } else {
                self.task_dependencies
                    .push(TaskName::from(dependency.to_string()));
            }
        }
        self.task_dependencies.sort();
        self.topological_dependencies.sort();
        self
    }

    pub fn workspace_relative_log_file(&self, task_name: &str) -> AnchoredSystemPathBuf {
        workspace_relative_log_file(task_name)
    }
}

/// The resolved pipeline configuration: task names mapped to definitions.
/// Lookup applies the override rule: a `pkg#task` entry wins over the bare
/// `task` entry, wholesale.
#[derive(Debug, Default, Clone)]
pub struct Pipeline {
    task_definitions: HashMap<TaskName<'static>, TaskDefinition>,
}

impl Pipeline {
    pub fn insert(&mut self, name: TaskName<'static>, definition: TaskDefinition) {
        self.task_definitions.insert(name, definition);
    }

    /// The definition governing `task_id`, package-specific entry first.
    pub fn definition_for(&self, task_id: &TaskId) -> Option<&TaskDefinition> {
        let qualified = TaskName::from(task_id.to_string());
        let bare = TaskName::from(task_id.task().to_string());
        self.task_definitions
            .get(&qualified)
            .or_else(|| self.task_definitions.get(&bare))
    }

    /// Whether any entry (qualified or not) could apply to this task name.
    pub fn has_entry_for(&self, task_id: &TaskId) -> bool {
        self.definition_for(task_id).is_some()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &TaskName<'static>> {
        self.task_definitions.keys()
    }
}

impl FromIterator<(TaskName<'static>, TaskDefinition)> for Pipeline {
    fn from_iter<T: IntoIterator<Item = (TaskName<'static>, TaskDefinition)>>(iter: T) -> Self {
        Pipeline {
            task_definitions: iter.into_iter().collect(),
        }
    }
}
