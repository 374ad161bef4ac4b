use convoy_cache::{CacheHitMetadata, CacheSource};
use convoy_engine::{EnvMode, TaskDefinition};
use convoy_env::EnvironmentVariablePairs;
use convoy_task_id::TaskId;
use convoypath::AnchoredSystemPathBuf;
use serde::Serialize;

use crate::{hash::FileHashes, run::summary::execution::TaskExecutionSummary};

/// Cache outcome for one task, in summary form.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub local: bool,
    pub remote: bool,
    pub status: CacheStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_saved: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    #[default]
    Miss,
}

impl From<Option<CacheHitMetadata>> for CacheSummary {
    fn from(value: Option<CacheHitMetadata>) -> Self {
        match value {
            None => CacheSummary::default(),
            Some(metadata) => CacheSummary {
                local: matches!(metadata.source, CacheSource::Local),
                remote: matches!(metadata.source, CacheSource::Remote),
                status: CacheStatus::Hit,
                time_saved: Some(metadata.time_saved),
            },
        }
    }
}

/// Env accounting for one task: what was declared and what it resolved to.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvVarSummary {
    pub specified: TaskEnvConfiguration,
    /// Resolved `NAME=sha256(value)` pairs that fed the hash.
    pub configured: EnvironmentVariablePairs,
    /// Names (not values) forwarded to the child without hashing.
    pub passthrough: Option<Vec<String>>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvConfiguration {
    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
}

/// Everything the summary records about one task. Mirrors the execution
/// record and inlines the resolved definition so a summary is
/// self-contained.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub inputs: FileHashes,
    pub hash_of_external_dependencies: String,
    pub cache: CacheSummary,
    pub command: Option<String>,
    pub cli_arguments: Vec<String>,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub directory: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub resolved_task_definition: TaskDefinition,
    pub expanded_outputs: Vec<AnchoredSystemPathBuf>,
    pub framework: Option<String>,
    pub env_mode: EnvMode,
    pub environment_variables: TaskEnvVarSummary,
    pub execution: Option<TaskExecutionSummary>,
}

impl TaskSummary {
    pub fn task_id(&self) -> TaskId {
        TaskId::try_from(self.task_id.as_str()).expect("summary task ids are fully qualified")
    }

    pub fn failed(&self) -> bool {
        matches!(
            self.execution.as_ref().map(|execution| &execution.state),
            Some(crate::run::summary::execution::ExecutionState::BuildFailed { .. })
        )
    }
}
