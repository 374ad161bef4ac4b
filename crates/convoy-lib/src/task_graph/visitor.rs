//! The scheduler: drives the engine's walk, hashing each ready task,
//! consulting the cache, and executing misses under the run's concurrency
//! and failure policy.

use std::{
    collections::{HashMap, HashSet},
    io::Write,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use console::StyledObject;
use convoy_engine::{
    Engine, EnvMode, ExecutionOptions, Message, StopExecution, TaskDefinition, TaskNode,
};
use convoy_process::{ChildExit, Command, ProcessManager};
use convoy_repository::{package_graph::ROOT_PKG_NAME, PackageGraph, PackageName};
use convoy_task_id::TaskId;
use convoy_ui::{
    ColorConfig, ColorSelector, OutputClient, OutputClientBehavior, OutputSink, OutputWriter,
    PrefixedUI, PrefixedWriter,
};
use convoypath::AbsoluteSystemPath;
use futures::{stream::FuturesUnordered, StreamExt};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::{
    opts::{ResolvedLogOrder, ResolvedLogPrefix, RunOpts},
    run::{
        cache::{CacheOutput, RunCache, TaskCache},
        summary::{self, RunTracker, TaskExecutionSummary, TaskSummary, TaskTracker},
    },
    task_hash::{self, TaskHashTracker, TaskHasher},
};

/// Environment variable carrying the task's own fingerprint, always present
/// in a task's environment.
pub const TASK_HASH_VAR: &str = "CONVOY_HASH";

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A task that terminated unsuccessfully, reported at the end of the run.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub task_id: String,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} exited: {}", self.task_id, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot find package {package_name} for task {task_id}.")]
    MissingPackage {
        package_name: PackageName,
        task_id: TaskId<'static>,
    },
    #[error(
        "The root task {task_name} runs `convoy`, which would recurse into this run. Adjust the \
         script or remove the root task."
    )]
    RecursiveConvoy { task_name: String, command: String },
    #[error("Could not find definition for task")]
    MissingDefinition,
    #[error("Error while executing engine: {0}")]
    Engine(#[from] convoy_engine::ExecuteError),
    #[error(transparent)]
    TaskHash(#[from] task_hash::Error),
    #[error(transparent)]
    RunSummary(#[from] summary::Error),
    #[error("Internal errors encountered: {0}")]
    InternalErrors(String),
}

// A tiny enum that lets stdout and stderr share a type without boxing.
pub enum StdWriter {
    Out(std::io::Stdout),
    Err(std::io::Stderr),
}

impl StdWriter {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            StdWriter::Out(out) => out,
            StdWriter::Err(err) => err,
        }
    }
}

impl Write for StdWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer().flush()
    }
}

// This holds the whole world
pub struct Visitor<'a> {
    color_cache: ColorSelector,
    dry: bool,
    global_env_mode: EnvMode,
    manager: ProcessManager,
    run_opts: &'a RunOpts,
    package_graph: Arc<PackageGraph>,
    repo_root: &'a AbsoluteSystemPath,
    run_cache: Arc<RunCache>,
    run_tracker: RunTracker,
    sink: OutputSink<StdWriter>,
    task_hasher: TaskHasher<'a>,
    color_config: ColorConfig,
    execution_results: ExecutionResults,
}

type ExecutionResults = Arc<Mutex<HashMap<TaskId<'static>, Option<TaskExecutionSummary>>>>;

impl<'a> Visitor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        package_graph: Arc<PackageGraph>,
        run_cache: Arc<RunCache>,
        run_tracker: RunTracker,
        task_hasher: TaskHasher<'a>,
        run_opts: &'a RunOpts,
        color_config: ColorConfig,
        manager: ProcessManager,
        repo_root: &'a AbsoluteSystemPath,
    ) -> Self {
        let sink = Self::sink(run_opts);
        let color_cache = ColorSelector::default();

        Self {
            color_cache,
            dry: false,
            global_env_mode: run_opts.env_mode,
            manager,
            run_opts,
            package_graph,
            repo_root,
            run_cache,
            run_tracker,
            sink,
            task_hasher,
            color_config,
            execution_results: Default::default(),
        }
    }

    /// Switches the visitor into dry-run mode: hashes and cache status are
    /// computed and reported, nothing executes.
    pub fn dry_run(&mut self) {
        self.dry = true;
    }

    #[tracing::instrument(skip_all)]
    pub async fn visit(&self, engine: Arc<Engine>) -> Result<Vec<TaskError>, Error> {
        let concurrency = self.run_opts.concurrency as usize;
        let (node_sender, mut node_stream) = mpsc::channel(concurrency.max(1));

        let engine_handle = {
            let engine = engine.clone();
            tokio::spawn(engine.execute(
                ExecutionOptions::new(self.run_opts.parallel, concurrency.max(1)),
                node_sender,
            ))
        };
        let mut tasks = FuturesUnordered::new();
        let errors: Arc<Mutex<Vec<TaskError>>> = Arc::new(Mutex::new(Vec::new()));
        // Failed tasks and their transitive dependents, for --continue skip
        // decisions
        let failed_tasks: Arc<Mutex<HashSet<TaskId<'static>>>> =
            Arc::new(Mutex::new(HashSet::new()));

        while let Some(message) = node_stream.recv().await {
            let Message { info, callback } = message;
            let package_name = PackageName::from(info.package());

            let workspace_info =
                self.package_graph
                    .package_info(&package_name)
                    .ok_or_else(|| Error::MissingPackage {
                        package_name: package_name.clone(),
                        task_id: info.clone(),
                    })?;

            let command = workspace_info.package_json.scripts.get(info.task()).cloned();

            // A root script that itself invokes `convoy` would loop forever
            if let Some(cmd) = &command {
                if info.package() == ROOT_PKG_NAME && convoy_regex().is_match(cmd) {
                    return Err(Error::RecursiveConvoy {
                        task_name: info.to_string(),
                        command: cmd.clone(),
                    });
                }
            }

            let task_definition = engine
                .task_definition(&info)
                .ok_or(Error::MissingDefinition)?;
            let task_env_mode = task_definition.env_mode.unwrap_or(self.global_env_mode);

            let dependency_set = engine.dependencies(&info).ok_or(Error::MissingDefinition)?;

            let task_hash = self.task_hasher.calculate_task_hash(
                &info,
                task_definition,
                task_env_mode,
                workspace_info,
                dependency_set,
            )?;
            debug!("task {} hash is {}", info, task_hash);

            let execution_env = self
                .task_hasher
                .env(&info, task_env_mode, task_definition)?;

            let task_cache = self.run_cache.task_cache(
                task_definition,
                workspace_info,
                info.clone(),
                &task_hash,
            );

            let tracker = self.run_tracker.track_task(info.clone());

            if self.dry {
                let dry_context = DryRunExecContext {
                    task_id: info.clone(),
                    task_cache,
                    hash_tracker: self.task_hasher.task_hash_tracker(),
                    execution_results: self.execution_results.clone(),
                };
                tasks.push(tokio::spawn(async move {
                    dry_context.execute_dry_run().await;
                    drop(callback);
                    Ok::<(), InternalError>(())
                }));
                continue;
            }

            // Under --continue, a task whose dependency failed is skipped
            // rather than run against broken inputs
            let upstream_failed = {
                let failed = failed_tasks.lock().expect("failed task set poisoned");
                engine
                    .dependencies(&info)
                    .map(|deps| {
                        deps.iter().any(
                            |dep| matches!(dep, TaskNode::Task(id) if failed.contains(id)),
                        )
                    })
                    .unwrap_or(false)
            };
            if upstream_failed {
                let execution_results = self.execution_results.clone();
                let failed_tasks = failed_tasks.clone();
                let task_id = info.clone();
                tasks.push(tokio::spawn(async move {
                    let summary = tracker.skipped().await;
                    execution_results
                        .lock()
                        .expect("execution results poisoned")
                        .insert(task_id.clone(), Some(summary));
                    // Skips propagate: dependents of a skipped task skip too
                    failed_tasks
                        .lock()
                        .expect("failed task set poisoned")
                        .insert(task_id);
                    callback.send(Ok(())).ok();
                    Ok::<(), InternalError>(())
                }));
                continue;
            }

            let takes_input = task_definition.interactive || task_definition.persistent;
            let cmd = self.task_command(&info, command.as_deref(), &execution_env, &task_hash, task_definition);

            let output_client = self.output_client();
            let pretty_prefix = self.prefix_with_color(&info);

            let exec_context = ExecContext {
                task_id: info.clone(),
                task_hash,
                cmd,
                manager: self.manager.clone(),
                takes_input,
                continue_on_error: self.run_opts.continue_on_error,
                color_config: self.color_config,
                pretty_prefix,
                task_cache,
                hash_tracker: self.task_hasher.task_hash_tracker(),
                errors: errors.clone(),
                failed_tasks: failed_tasks.clone(),
                execution_results: self.execution_results.clone(),
            };

            tasks.push(tokio::spawn(async move {
                exec_context.execute(tracker, output_client, callback).await
            }));
        }

        // First the engine walk, then every in-flight task
        engine_handle.await.expect("engine execution panicked")?;
        let mut internal_errors = Vec::new();
        while let Some(result) = tasks.next().await {
            if let Err(e) = result.unwrap_or_else(|e| panic!("task executor panicked: {e}")) {
                internal_errors.push(e);
            }
        }

        if !internal_errors.is_empty() {
            return Err(Error::InternalErrors(
                internal_errors
                    .into_iter()
                    .map(|e: InternalError| e.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ));
        }

        let errors = Arc::into_inner(errors)
            .expect("only one strong reference to errors should remain")
            .into_inner()
            .expect("mutex poisoned");

        Ok(errors)
    }

    /// Builds the summary for every visited task, closes the run tracker,
    /// and writes/prints the run summary.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish(
        self,
        exit_code: i32,
        interrupted: bool,
        engine: &Engine,
        global_hash: String,
        global_hash_inputs: &crate::run::global_hash::GlobalHashableInputs,
    ) -> Result<Option<convoypath::AbsoluteSystemPathBuf>, Error> {
        let hash_tracker = self.task_hasher.task_hash_tracker();
        let execution_results = std::mem::take(
            &mut *self
                .execution_results
                .lock()
                .expect("execution results poisoned"),
        );

        let mut packages: HashSet<String> = HashSet::new();

        for (task_id, execution) in execution_results {
            packages.insert(task_id.package().to_string());
            let summary = self.task_summary(&task_id, engine, &hash_tracker, execution);
            self.run_tracker.add_task_summary(summary).await;
        }

        let mut packages: Vec<_> = packages.into_iter().collect();
        packages.sort();

        Ok(self
            .run_tracker
            .finish(
                exit_code,
                interrupted,
                self.repo_root,
                self.run_opts,
                packages,
                global_hash,
                global_hash_inputs,
                self.color_config,
            )
            .await?)
    }

    fn task_summary(
        &self,
        task_id: &TaskId<'static>,
        engine: &Engine,
        hash_tracker: &TaskHashTracker,
        execution: Option<TaskExecutionSummary>,
    ) -> TaskSummary {
        let workspace_info = self
            .package_graph
            .package_info(&PackageName::from(task_id.package()));
        let task_definition = engine.task_definition(task_id).cloned().unwrap_or_default();

        let collect_neighbors = |nodes: Option<HashSet<&TaskNode>>| {
            let mut neighbors: Vec<_> = nodes
                .into_iter()
                .flatten()
                .filter_map(|node| match node {
                    TaskNode::Task(id) => Some(id.to_string()),
                    TaskNode::Root => None,
                })
                .collect();
            neighbors.sort();
            neighbors
        };

        let env_vars = hash_tracker.env_vars(task_id);
        let log_file = workspace_info
            .map(|info| {
                info.package_path()
                    .to_unix()
                    .join(&convoy_engine::workspace_relative_log_file(task_id.task()).to_unix())
                    .into_string()
            })
            .unwrap_or_default();

        TaskSummary {
            task_id: task_id.to_string(),
            task: task_id.task().to_string(),
            package: task_id.package().to_string(),
            hash: hash_tracker.hash(task_id).unwrap_or_default(),
            inputs: self.task_hasher.expanded_inputs(task_id).unwrap_or_default(),
            hash_of_external_dependencies: workspace_info
                .map(|info| info.get_external_deps_hash())
                .unwrap_or_default(),
            cache: hash_tracker.cache_status(task_id).into(),
            command: workspace_info
                .and_then(|info| info.package_json.scripts.get(task_id.task()).cloned()),
            cli_arguments: self.run_opts.pass_through_args.clone(),
            outputs: task_definition.outputs.inclusions.clone(),
            excluded_outputs: task_definition.outputs.exclusions.clone(),
            log_file,
            directory: workspace_info
                .map(|info| info.package_path().to_unix().into_string())
                .unwrap_or_default(),
            dependencies: collect_neighbors(engine.dependencies(task_id)),
            dependents: collect_neighbors(engine.dependents(task_id)),
            expanded_outputs: hash_tracker.expanded_outputs(task_id).unwrap_or_default(),
            framework: workspace_info.and_then(|info| info.framework.clone()),
            env_mode: task_definition.env_mode.unwrap_or(self.global_env_mode),
            environment_variables: summary::TaskEnvVarSummary {
                specified: summary::TaskEnvConfiguration {
                    env: task_definition.env.clone(),
                    pass_through_env: task_definition.pass_through_env.clone(),
                },
                configured: env_vars
                    .map(|vars| vars.all.to_secret_hashable())
                    .unwrap_or_default(),
                passthrough: task_definition.pass_through_env.clone(),
            },
            resolved_task_definition: task_definition,
            execution,
        }
    }

    // The child invocation: the package script run through the platform
    // shell, in the package directory, with the fully resolved environment.
    fn task_command(
        &self,
        task_id: &TaskId<'static>,
        script: Option<&str>,
        execution_env: &convoy_env::EnvironmentVariableMap,
        task_hash: &str,
        task_definition: &TaskDefinition,
    ) -> Option<Command> {
        let script = script?;
        if script.trim().is_empty() {
            return None;
        }

        let mut full_script = script.to_string();
        if !self.run_opts.pass_through_args.is_empty() {
            full_script.push(' ');
            full_script.push_str(&self.run_opts.pass_through_args.join(" "));
        }

        #[cfg(windows)]
        let (program, args) = ("cmd", vec!["/C".to_string(), full_script]);
        #[cfg(not(windows))]
        let (program, args) = ("sh", vec!["-c".to_string(), full_script]);

        let package_dir = self
            .package_graph
            .package_dir(&PackageName::from(task_id.package()))
            .map(|dir| self.repo_root.resolve(dir))
            .unwrap_or_else(|| self.repo_root.to_owned());

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(package_dir);
        cmd.envs(execution_env.iter());
        // Always last so nothing user-configured can shadow it
        cmd.envs([(TASK_HASH_VAR, task_hash)]);
        if task_definition.interactive || task_definition.persistent {
            cmd.open_stdin();
        }
        Some(cmd)
    }

    fn sink(run_opts: &RunOpts) -> OutputSink<StdWriter> {
        let (out, err) = if run_opts.should_redirect_stderr_to_stdout() {
            (StdWriter::Out(std::io::stdout()), StdWriter::Out(std::io::stdout()))
        } else {
            (StdWriter::Out(std::io::stdout()), StdWriter::Err(std::io::stderr()))
        };
        OutputSink::new(out, err)
    }

    fn output_client(&self) -> OutputClient<StdWriter> {
        let behavior = match self.run_opts.resolved_log_order() {
            ResolvedLogOrder::Stream => OutputClientBehavior::Passthrough,
            ResolvedLogOrder::Grouped => OutputClientBehavior::Grouped,
        };
        self.sink.logger(behavior)
    }

    fn prefix(&self, task_id: &TaskId) -> String {
        match self.run_opts.resolved_log_prefix() {
            ResolvedLogPrefix::Task if self.run_opts.single_package => task_id.task().to_string(),
            ResolvedLogPrefix::Task => format!("{}:{}", task_id.package(), task_id.task()),
            ResolvedLogPrefix::None => String::new(),
        }
    }

    fn prefix_with_color(&self, task_id: &TaskId) -> StyledObject<String> {
        self.color_cache
            .prefix_with_color(&task_id.to_string(), &self.prefix(task_id))
    }
}

fn convoy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)convoy(?:$|\s)").expect("valid regex"))
}

// Errors internal to the executor machinery, as opposed to task failures,
// which are data.
#[derive(Debug, thiserror::Error)]
enum InternalError {
    #[error("unable to determine why task exited")]
    UnknownChildExit,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Path(#[from] convoypath::PathError),
}

struct ExecContext {
    task_id: TaskId<'static>,
    task_hash: String,
    cmd: Option<Command>,
    manager: ProcessManager,
    takes_input: bool,
    continue_on_error: bool,
    color_config: ColorConfig,
    pretty_prefix: StyledObject<String>,
    task_cache: TaskCache,
    hash_tracker: TaskHashTracker,
    errors: Arc<Mutex<Vec<TaskError>>>,
    failed_tasks: Arc<Mutex<HashSet<TaskId<'static>>>>,
    execution_results: ExecutionResults,
}

impl ExecContext {
    async fn execute(
        mut self,
        tracker: TaskTracker<()>,
        output_client: OutputClient<StdWriter>,
        callback: oneshot::Sender<Result<(), StopExecution>>,
    ) -> Result<(), InternalError> {
        let tracker = tracker.start().await;

        let mut prefixed_ui = PrefixedUI::new(
            self.color_config,
            output_client.stdout(),
            output_client.stderr(),
        )
        .with_output_prefix(self.pretty_prefix.clone())
        .with_error_prefix(
            console::Style::new().apply_to(format!("{}ERROR: ", self.pretty_prefix.clone())),
        )
        .with_warn_prefix(self.pretty_prefix.clone());

        // 1. Cache lookup
        match self.task_cache.restore_outputs(&mut prefixed_ui).await {
            Ok(Some(status)) => {
                self.hash_tracker
                    .insert_cache_status(self.task_id.clone(), Some(status));
                self.hash_tracker.insert_expanded_outputs(
                    self.task_id.clone(),
                    self.task_cache.expanded_outputs().to_vec(),
                );
                let summary = tracker.cached().await;
                self.record(Some(summary));
                callback.send(Ok(())).ok();
                drop(prefixed_ui);
                Self::finish_output(output_client);
                return Ok(());
            }
            Ok(None) => {
                self.hash_tracker
                    .insert_cache_status(self.task_id.clone(), None);
            }
            Err(err) => {
                // Read problems degrade to a miss
                warn!("failed to restore outputs for {}: {err}", self.task_id);
                self.hash_tracker
                    .insert_cache_status(self.task_id.clone(), None);
            }
        }

        // 2. Execute
        let Some(cmd) = self.cmd.take() else {
            // No script to run; the hash exists so dependents can build on
            // it, but there is nothing to do
            let summary = tracker.build_succeeded(0).await;
            self.record(Some(summary));
            callback.send(Ok(())).ok();
            drop(prefixed_ui);
            Self::finish_output(output_client);
            return Ok(());
        };

        let child = self.manager.spawn(cmd, STOP_GRACE_PERIOD);
        let Some(child) = child else {
            // The manager is shutting down; this task never started
            let summary = tracker.cancel();
            self.record(Some(summary));
            drop(callback);
            drop(prefixed_ui);
            Self::finish_output(output_client);
            return Ok(());
        };
        let mut child = match child {
            Ok(child) => child,
            Err(spawn_err) => {
                let message = format!("unable to spawn child process: {spawn_err}");
                prefixed_ui.error(&message);
                self.report_failure(None, message.clone());
                let summary = tracker.build_failed(None, message).await;
                self.record(Some(summary));
                let result = if self.continue_on_error {
                    Ok(())
                } else {
                    Err(StopExecution)
                };
                callback.send(result).ok();
                drop(prefixed_ui);
                Self::finish_output(output_client);
                return Ok(());
            }
        };

        // 3. Stream output to the log file and, depending on the task's
        // output mode, the terminal
        self.task_cache.log_file_path().ensure_dir()?;
        let log_file = std::fs::File::create(self.task_cache.log_file_path().as_std_path())?;
        let log_file = Arc::new(Mutex::new(std::io::BufWriter::new(log_file)));

        let stream_to_terminal = self.task_cache.should_stream_outputs() && !self.takes_input;
        let stdout_writer = TaskOutputWriter {
            log_file: log_file.clone(),
            terminal: stream_to_terminal.then(|| {
                PrefixedWriter::new(
                    self.color_config,
                    self.pretty_prefix.clone(),
                    output_client.stdout(),
                )
            }),
        };
        let stderr_writer = TaskOutputWriter {
            log_file: log_file.clone(),
            terminal: stream_to_terminal.then(|| {
                PrefixedWriter::new(
                    self.color_config,
                    self.pretty_prefix.clone(),
                    output_client.stderr(),
                )
            }),
        };

        let exit = child
            .wait_with_piped_outputs(stdout_writer, stderr_writer)
            .await?;

        // The log must be complete on disk before caching or replay
        if let Ok(mut file) = log_file.lock() {
            file.flush()?;
        }

        match exit {
            Some(ChildExit::Finished(Some(0))) => {
                let duration = tracker.elapsed_ms();
                if let Err(err) = self.task_cache.save_outputs(duration, &mut prefixed_ui).await {
                    warn!("error caching output for {}: {err}", self.task_id);
                } else {
                    self.hash_tracker.insert_expanded_outputs(
                        self.task_id.clone(),
                        self.task_cache.expanded_outputs().to_vec(),
                    );
                }
                let summary = tracker.build_succeeded(0).await;
                self.record(Some(summary));
                callback.send(Ok(())).ok();
            }
            Some(ChildExit::Finished(code)) => {
                let message = match code {
                    Some(code) => format!("command finished with error: exit code {code}"),
                    None => "command finished with error".to_string(),
                };
                // errors-only tasks reveal their suppressed log now
                if let Err(err) = self.task_cache.on_error(&mut prefixed_ui) {
                    warn!("failed to replay error logs for {}: {err}", self.task_id);
                }
                prefixed_ui.error(&message);
                self.report_failure(code, message.clone());
                let summary = tracker.build_failed(code, message).await;
                self.record(Some(summary));

                if self.continue_on_error {
                    callback.send(Ok(())).ok();
                } else {
                    callback.send(Err(StopExecution)).ok();
                    self.manager.stop().await;
                }
            }
            Some(ChildExit::Killed) | Some(ChildExit::KilledExternal) => {
                let summary = tracker.cancel();
                self.record(Some(summary));
                drop(callback);
            }
            Some(ChildExit::Failed) | None => {
                drop(callback);
                return Err(InternalError::UnknownChildExit);
            }
        }

        drop(prefixed_ui);
        Self::finish_output(output_client);
        Ok(())
    }

    fn report_failure(&self, exit_code: Option<i32>, message: String) {
        let error = TaskError {
            task_id: self.task_id.to_string(),
            exit_code,
            message,
        };
        self.errors
            .lock()
            .expect("errors lock poisoned")
            .push(error);
        self.failed_tasks
            .lock()
            .expect("failed task set poisoned")
            .insert(self.task_id.clone());
    }

    fn record(&self, summary: Option<TaskExecutionSummary>) {
        self.execution_results
            .lock()
            .expect("execution results poisoned")
            .insert(self.task_id.clone(), summary);
    }

    fn finish_output(output_client: OutputClient<StdWriter>) {
        if let Err(err) = output_client.finish() {
            error!("unable to flush output client: {err}");
        }
    }
}

struct DryRunExecContext {
    task_id: TaskId<'static>,
    task_cache: TaskCache,
    hash_tracker: TaskHashTracker,
    execution_results: ExecutionResults,
}

impl DryRunExecContext {
    async fn execute_dry_run(&self) {
        // A dry run wants the cache answer without restoring anything
        match self.task_cache.exists().await {
            Ok(status) => self
                .hash_tracker
                .insert_cache_status(self.task_id.clone(), status),
            Err(err) => warn!("failed to probe cache for {}: {err}", self.task_id),
        }
        self.execution_results
            .lock()
            .expect("execution results poisoned")
            .insert(self.task_id.clone(), None);
    }
}

/// Tees a child's output stream into the task log file and, optionally, the
/// terminal pipeline.
struct TaskOutputWriter<'a, W: Write> {
    log_file: Arc<Mutex<std::io::BufWriter<std::fs::File>>>,
    terminal: Option<PrefixedWriter<OutputWriter<'a, W>>>,
}

impl<W: Write> Write for TaskOutputWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // The log file gets the bytes exactly as written, unprefixed
        self.log_file
            .lock()
            .expect("log file lock poisoned")
            .write_all(buf)?;
        if let Some(terminal) = &mut self.terminal {
            terminal.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.log_file
            .lock()
            .expect("log file lock poisoned")
            .flush()?;
        if let Some(terminal) = &mut self.terminal {
            terminal.flush()?;
        }
        Ok(())
    }
}

impl<W: Write> CacheOutput for PrefixedUI<W> {
    fn status(&mut self, message: &str) {
        self.output(message);
    }

    fn error(&mut self, message: &str) {
        PrefixedUI::error(self, message);
    }

    fn replay_logs(&mut self, log_file: &AbsoluteSystemPath) -> Result<(), convoy_ui::Error> {
        let writer = self.output_prefixed_writer();
        convoy_ui::replay_logs(writer, log_file)
    }
}
