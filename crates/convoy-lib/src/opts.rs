use convoy_engine::{EnvMode, OutputLogsMode};

/// How task log lines are ordered on the terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogOrder {
    #[default]
    Auto,
    /// Lines appear as the OS pipes deliver them, interleaved across tasks.
    Stream,
    /// Each task's output is held back and emitted as one block when the
    /// task terminates.
    Grouped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedLogOrder {
    Stream,
    Grouped,
}

/// How task log lines are prefixed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogPrefix {
    #[default]
    Auto,
    Task,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedLogPrefix {
    Task,
    None,
}

/// Per-run execution settings. Field defaults match an interactive
/// invocation with no flags.
#[derive(Debug, Clone)]
pub struct RunOpts {
    pub concurrency: u32,
    /// Ignore dependency ordering and run everything at once.
    pub parallel: bool,
    /// Keep running siblings after a task fails; dependents of the failed
    /// task are skipped.
    pub continue_on_error: bool,
    /// Ignore existing cache entries (reads disabled).
    pub force: bool,
    /// Do not store new cache entries (writes disabled).
    pub no_cache: bool,
    /// Skip the filesystem cache tier.
    pub remote_only: bool,
    /// Read from the remote tier but never upload.
    pub remote_cache_read_only: bool,
    /// Upload to the remote tier but never read from it.
    pub remote_cache_write_only: bool,
    pub dry_run: bool,
    pub env_mode: EnvMode,
    pub framework_inference: bool,
    pub log_order: LogOrder,
    pub log_prefix: LogPrefix,
    pub output_logs_override: Option<OutputLogsMode>,
    /// Literal arguments forwarded to every task's script.
    pub pass_through_args: Vec<String>,
    pub summarize: bool,
    pub single_package: bool,
    /// Rendered form of the invocation, recorded in the run summary.
    pub synthesized_command: String,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            parallel: false,
            continue_on_error: false,
            force: false,
            no_cache: false,
            remote_only: false,
            remote_cache_read_only: false,
            remote_cache_write_only: false,
            dry_run: false,
            env_mode: EnvMode::default(),
            framework_inference: true,
            log_order: LogOrder::default(),
            log_prefix: LogPrefix::default(),
            output_logs_override: None,
            pass_through_args: Vec::new(),
            summarize: false,
            single_package: false,
            synthesized_command: "convoy run".to_string(),
        }
    }
}

pub fn default_concurrency() -> u32 {
    num_cpus::get() as u32 + 2
}

impl RunOpts {
    pub fn resolved_log_order(&self) -> ResolvedLogOrder {
        match self.log_order {
            LogOrder::Stream => ResolvedLogOrder::Stream,
            LogOrder::Grouped => ResolvedLogOrder::Grouped,
            // Streaming reads best interactively; grouped output is only
            // worth it when asked for
            LogOrder::Auto => ResolvedLogOrder::Stream,
        }
    }

    pub fn resolved_log_prefix(&self) -> ResolvedLogPrefix {
        match self.log_prefix {
            LogPrefix::Task | LogPrefix::Auto => ResolvedLogPrefix::Task,
            LogPrefix::None => ResolvedLogPrefix::None,
        }
    }

    // Grouped blocks interleave stdout and stderr; splitting them across
    // two streams would tear the groups apart.
    pub fn should_redirect_stderr_to_stdout(&self) -> bool {
        matches!(self.resolved_log_order(), ResolvedLogOrder::Grouped)
    }

    pub fn run_cache_opts(&self) -> RunCacheOpts {
        RunCacheOpts {
            skip_reads: self.force,
            skip_writes: self.no_cache,
            task_output_logs_override: self.output_logs_override,
        }
    }
}

/// The cache read/write decision table derived from run flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunCacheOpts {
    pub skip_reads: bool,
    pub skip_writes: bool,
    pub task_output_logs_override: Option<OutputLogsMode>,
}
