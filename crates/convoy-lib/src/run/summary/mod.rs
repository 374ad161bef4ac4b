//! The machine-readable record of what a run did, written to
//! `.convoy/runs/<id>.json` when summarization is enabled.

mod execution;
mod scm;
mod task;

use std::collections::HashMap;

use chrono::{DateTime, Local};
pub use execution::{
    ExecutionState, ExecutionTracker, SkipReason, SummaryState, TaskExecutionSummary, TaskTracker,
};
use convoy_engine::EnvMode;
use convoy_env::{EnvironmentVariableMap, EnvironmentVariablePairs};
use convoy_ui::ColorConfig;
use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, RelativeUnixPathBuf};
pub use scm::ScmState;
use serde::Serialize;
use svix_ksuid::{Ksuid, KsuidLike};
pub use task::{CacheStatus, CacheSummary, TaskEnvConfiguration, TaskEnvVarSummary, TaskSummary};
use tokio::sync::Mutex;

use crate::{opts::RunOpts, run::global_hash::GlobalHashableInputs};

/// Schema version of the summary file. Any incompatible layout change gets
/// a new version so consumers can dispatch.
const RUN_SUMMARY_SCHEMA_VERSION: &str = "1";

const CONVOY_VERSION: &str = env!("CARGO_PKG_VERSION");

const RUNS_DIR: &str = "runs";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to write run summary: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write run summary: {0}")]
    Path(#[from] convoypath::PathError),
    #[error("Failed to serialize run summary to JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Failed to close execution tally: {0}")]
    Tally(#[from] tokio::task::JoinError),
}

/// The global hash inputs, in reportable form.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHashSummary {
    pub root_key: String,
    pub files: HashMap<RelativeUnixPathBuf, String>,
    pub hash_of_external_dependencies: String,
    pub environment_variables: GlobalEnvVarSummary,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEnvVarSummary {
    pub specified: Vec<String>,
    pub configured: EnvironmentVariablePairs,
    pub passthrough: Option<Vec<String>>,
}

impl From<&GlobalHashableInputs> for GlobalHashSummary {
    fn from(inputs: &GlobalHashableInputs) -> Self {
        GlobalHashSummary {
            root_key: inputs.global_cache_key.clone(),
            files: inputs.global_file_hash_map.clone(),
            hash_of_external_dependencies: inputs.root_external_deps_hash.clone(),
            environment_variables: GlobalEnvVarSummary {
                specified: inputs.env.clone(),
                configured: inputs.resolved_env_vars.clone(),
                passthrough: inputs.pass_through_env.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary {
    id: String,
    version: String,
    convoy_version: String,
    monorepo: bool,
    global_cache_inputs: GlobalHashSummary,
    global_hash: String,
    packages: Vec<String>,
    env_mode: EnvMode,
    framework_inference: bool,
    execution: execution::ExecutionSummary,
    tasks: Vec<TaskSummary>,
    user: Option<String>,
    scm: ScmState,
}

/// Collects task summaries and the execution tally over a run, then
/// assembles, prints, and optionally persists the summary.
pub struct RunTracker {
    execution_tracker: ExecutionTracker,
    task_summaries: Mutex<Vec<TaskSummary>>,
    started_at: DateTime<Local>,
    user: Option<String>,
    scm: ScmState,
}

impl RunTracker {
    pub fn new(started_at: DateTime<Local>, env_at_execution_start: &EnvironmentVariableMap) -> Self {
        RunTracker {
            execution_tracker: ExecutionTracker::new(started_at),
            task_summaries: Mutex::new(Vec::new()),
            started_at,
            user: get_user(env_at_execution_start),
            scm: ScmState::get(env_at_execution_start),
        }
    }

    pub fn track_task(&self, task_id: convoy_task_id::TaskId<'static>) -> TaskTracker<()> {
        self.execution_tracker.tracker(task_id)
    }

    pub async fn add_task_summary(&self, summary: TaskSummary) {
        self.task_summaries.lock().await.push(summary);
    }

    /// Closes the run: waits for the tally, prints the outcome table, and
    /// writes the summary file when enabled. Returns the summary path when
    /// one was written.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish(
        self,
        exit_code: i32,
        interrupted: bool,
        repo_root: &AbsoluteSystemPath,
        run_opts: &RunOpts,
        packages: Vec<String>,
        global_hash: String,
        global_hash_inputs: &GlobalHashableInputs,
        color_config: ColorConfig,
    ) -> Result<Option<AbsoluteSystemPathBuf>, Error> {
        let RunTracker {
            execution_tracker,
            task_summaries,
            started_at,
            user,
            scm,
        } = self;

        let state = execution_tracker.finish().await?;
        let mut tasks = task_summaries.into_inner();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let execution = execution::ExecutionSummary {
            command: run_opts.synthesized_command.clone(),
            success: state.success,
            failed: state.failed,
            cached: state.cached,
            attempted: state.attempted,
            start_time: started_at,
            end_time: Some(Local::now()),
            exit_code: Some(exit_code),
            interrupted,
        };

        let run_summary = RunSummary {
            id: Ksuid::new(None, None).to_string(),
            version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            convoy_version: CONVOY_VERSION.to_string(),
            monorepo: !run_opts.single_package,
            global_cache_inputs: GlobalHashSummary::from(global_hash_inputs),
            global_hash,
            packages,
            env_mode: run_opts.env_mode,
            framework_inference: run_opts.framework_inference,
            execution,
            tasks,
            user,
            scm,
        };

        let summary_path = if run_opts.summarize {
            let path = repo_root.join_components(&[
                convoy_engine::LOG_DIR,
                RUNS_DIR,
                &format!("{}.json", run_summary.id),
            ]);
            path.ensure_dir()?;
            path.create_with_contents(serde_json::to_string_pretty(&run_summary)?)?;
            Some(path)
        } else {
            None
        };

        print_outcome(&run_summary, summary_path.as_deref(), color_config);

        Ok(summary_path)
    }
}

fn get_user(env_vars: &EnvironmentVariableMap) -> Option<String> {
    env_vars
        .get("USER")
        .or_else(|| env_vars.get("USERNAME"))
        .cloned()
}

// The post-run terminal report: outcome table, failed task list, summary
// file path, interruption banner.
fn print_outcome(
    summary: &RunSummary,
    summary_path: Option<&AbsoluteSystemPath>,
    color_config: ColorConfig,
) {
    let execution = &summary.execution;
    let duration = execution
        .end_time
        .unwrap_or_else(Local::now)
        .signed_duration_since(execution.start_time);

    println!();
    println!(
        "  Tasks:    {}, {} total",
        color_config.apply(
            convoy_ui::bold_green().apply_to(format!("{} successful", execution.success))
        ),
        execution.attempted
    );
    println!(
        " Cached:    {}, {} total",
        color_config.apply(convoy_ui::bold().apply_to(format!("{} cached", execution.cached))),
        execution.attempted
    );
    println!(
        "   Time:    {}",
        color_config.apply(
            convoy_ui::bold().apply_to(format_duration(duration.num_milliseconds()))
        )
    );

    let failed: Vec<_> = summary.tasks.iter().filter(|task| task.failed()).collect();
    if !failed.is_empty() {
        let mut names: Vec<_> = failed
            .iter()
            .map(|task| {
                color_config.apply(convoy_ui::bold_red().apply_to(task.task_id.clone()))
            })
            .collect();
        names.sort();
        println!(" Failed:    {}", names.join(", "));
        for task in failed {
            println!("    {}: see {}", task.task_id, task.log_file);
        }
    }

    if let Some(path) = summary_path {
        println!("Summary:    {path}");
    }

    if execution.interrupted {
        println!();
        println!(
            "{}",
            color_config.apply(convoy_ui::yellow().apply_to("run interrupted"))
        );
    }
    println!();
}

fn format_duration(millis: i64) -> String {
    if millis >= 60_000 {
        format!("{}m{}s", millis / 60_000, (millis % 60_000) / 1000)
    } else if millis >= 1000 {
        format!("{:.2}s", millis as f64 / 1000.0)
    } else {
        format!("{millis}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(450), "450ms");
        assert_eq!(format_duration(1500), "1.50s");
        assert_eq!(format_duration(61_000), "1m1s");
    }

    #[tokio::test]
    async fn test_summaries_sorted_in_output() {
        let env = EnvironmentVariableMap::default();
        let tracker = RunTracker::new(Local::now(), &env);

        for package in ["zebra", "alpha"] {
            tracker
                .add_task_summary(TaskSummary {
                    task_id: format!("{package}#build"),
                    task: "build".to_string(),
                    package: package.to_string(),
                    hash: "hash000000000000".to_string(),
                    inputs: Default::default(),
                    hash_of_external_dependencies: String::new(),
                    cache: Default::default(),
                    command: None,
                    cli_arguments: Vec::new(),
                    outputs: Vec::new(),
                    excluded_outputs: Vec::new(),
                    log_file: String::new(),
                    directory: String::new(),
                    dependencies: Vec::new(),
                    dependents: Vec::new(),
                    resolved_task_definition: Default::default(),
                    expanded_outputs: Vec::new(),
                    framework: None,
                    env_mode: EnvMode::Infer,
                    environment_variables: Default::default(),
                    execution: None,
                })
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let opts = RunOpts {
            summarize: true,
            ..Default::default()
        };
        let path = tracker
            .finish(
                0,
                false,
                &repo_root,
                &opts,
                vec!["alpha".to_string(), "zebra".to_string()],
                "globalhash000000".to_string(),
                &GlobalHashableInputs::default(),
                ColorConfig::new(true),
            )
            .await
            .unwrap()
            .expect("summarize writes a file");

        let contents = path.read_to_string().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["version"], "1");
        let tasks = parsed["tasks"].as_array().unwrap();
        assert_eq!(tasks[0]["taskId"], "alpha#build");
        assert_eq!(tasks[1]["taskId"], "zebra#build");
        assert_eq!(parsed["execution"]["attempted"], 0);
    }
}
