//! A single run: construct the engine, hash the world, drive the
//! scheduler, shut everything down cleanly, and report.

pub mod cache;
pub mod global_hash;
pub mod summary;

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Local;
use convoy_analytics::AnalyticsHandle;
use convoy_api_client::{APIAuth, APIClient};
use convoy_cache::{AsyncCache, CacheOpts};
use convoy_engine::{Engine, EngineBuilder, Pipeline, ValidateError};
use convoy_env::EnvironmentVariableMap;
use convoy_process::ProcessManager;
use convoy_repository::{PackageGraph, PackageName};
use convoy_scm::SCM;
use convoy_task_id::TaskName;
use convoy_ui::ColorConfig;
use convoypath::{AbsoluteSystemPathBuf, RelativeUnixPathBuf};
use tracing::{debug, warn};

pub use crate::run::cache::RunCache;
use crate::{
    opts::RunOpts,
    run::{global_hash::GlobalHashableInputs, summary::RunTracker},
    signal::SignalHandler,
    task_graph::Visitor,
    task_hash::{PackageInputsHashes, TaskHasher},
};

/// Exit code reported when a run is interrupted by a signal while tasks
/// were in flight.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

const UPLOAD_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Builder(#[from] convoy_engine::BuilderError),
    #[error("Invalid task configuration:\n{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"))]
    Validation(Vec<ValidateError>),
    #[error(transparent)]
    Cache(#[from] convoy_cache::CacheError),
    #[error(transparent)]
    GlobalHash(#[from] global_hash::Error),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    Visitor(#[from] crate::task_graph::VisitorError),
    #[error(transparent)]
    Summary(#[from] summary::Error),
    #[error("unable to install signal handling: {0}")]
    Signal(#[from] std::io::Error),
}

/// Repo-level configuration the pipeline carries alongside task
/// definitions.
#[derive(Debug, Default, Clone)]
pub struct GlobalConfig {
    pub global_deps: Vec<String>,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub global_dot_env: Vec<RelativeUnixPathBuf>,
}

/// Remote cache credentials, when a remote tier is configured.
#[derive(Debug, Clone)]
pub struct RemoteCacheConfig {
    pub api_url: String,
    pub token: String,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
    pub timeout: Option<Duration>,
    pub signature: bool,
}

/// Everything a run needs, assembled by the embedding layer: the package
/// graph and pipeline are inputs, not something the core discovers.
pub struct RunBuilder {
    repo_root: AbsoluteSystemPathBuf,
    package_graph: Arc<PackageGraph>,
    pipeline: Pipeline,
    global_config: GlobalConfig,
    opts: RunOpts,
    requested_tasks: Vec<TaskName<'static>>,
    filtered_packages: Vec<PackageName>,
    cache_dir: camino::Utf8PathBuf,
    remote_cache: Option<RemoteCacheConfig>,
    color_config: ColorConfig,
}

impl RunBuilder {
    pub fn new(
        repo_root: AbsoluteSystemPathBuf,
        package_graph: PackageGraph,
        pipeline: Pipeline,
        opts: RunOpts,
    ) -> Self {
        Self {
            repo_root,
            package_graph: Arc::new(package_graph),
            pipeline,
            global_config: GlobalConfig::default(),
            opts,
            requested_tasks: Vec::new(),
            filtered_packages: Vec::new(),
            cache_dir: camino::Utf8PathBuf::from(".convoy/cache"),
            remote_cache: None,
            color_config: ColorConfig::infer(),
        }
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.requested_tasks = tasks.into_iter().collect();
        self
    }

    /// Restricts the run to the given packages. An empty filter means every
    /// package.
    pub fn with_package_filter(mut self, packages: Vec<PackageName>) -> Self {
        self.filtered_packages = packages;
        self
    }

    pub fn with_global_config(mut self, global_config: GlobalConfig) -> Self {
        self.global_config = global_config;
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: camino::Utf8PathBuf) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    pub fn with_remote_cache(mut self, remote_cache: RemoteCacheConfig) -> Self {
        self.remote_cache = Some(remote_cache);
        self
    }

    pub fn with_color_config(mut self, color_config: ColorConfig) -> Self {
        self.color_config = color_config;
        self
    }

    pub fn build(self) -> Run {
        let filtered_packages = if self.filtered_packages.is_empty() {
            let mut packages: Vec<_> = self
                .package_graph
                .packages()
                .map(|(name, _)| name.clone())
                .collect();
            packages.sort();
            packages
        } else {
            self.filtered_packages
        };

        Run {
            repo_root: self.repo_root,
            package_graph: self.package_graph,
            pipeline: self.pipeline,
            global_config: self.global_config,
            opts: self.opts,
            requested_tasks: self.requested_tasks,
            filtered_packages,
            cache_dir: self.cache_dir,
            remote_cache: self.remote_cache,
            color_config: self.color_config,
        }
    }
}

pub struct Run {
    repo_root: AbsoluteSystemPathBuf,
    package_graph: Arc<PackageGraph>,
    pipeline: Pipeline,
    global_config: GlobalConfig,
    opts: RunOpts,
    requested_tasks: Vec<TaskName<'static>>,
    filtered_packages: Vec<PackageName>,
    cache_dir: camino::Utf8PathBuf,
    remote_cache: Option<RemoteCacheConfig>,
    color_config: ColorConfig,
}

impl Run {
    /// Executes the run end to end and returns the process exit code.
    pub async fn run(self, signal_handler: &SignalHandler) -> Result<i32, Error> {
        let started_at = Local::now();
        let env_at_execution_start = EnvironmentVariableMap::infer();
        let scm = SCM::new(&self.repo_root);

        // 1. Materialize and validate the task graph
        let engine = self.build_engine()?;
        if engine.is_empty() {
            println!("No tasks to run");
            return Ok(0);
        }

        // 2. Global hash, shared by every task
        let global_hash_inputs = get_global_hash_inputs_for_run(
            &self,
            &scm,
            &env_at_execution_start,
        )?;
        let global_hash = global_hash_inputs.calculate_global_hash();
        debug!("global hash: {global_hash}");

        // 3. Per-package file hashes
        let workspaces: HashMap<_, _> = self.package_graph.packages().collect();
        let package_inputs_hashes = PackageInputsHashes::calculate_file_hashes(
            &scm,
            engine.tasks(),
            &workspaces,
            engine.task_definitions(),
            &self.repo_root,
            None,
        )?;

        // 4. Cache stack: local tier, optional remote tier, analytics
        let (api, analytics) = self.remote_cache_stack();
        let (analytics_sender, analytics_handle) = match analytics {
            Some((sender, handle)) => (Some(sender), Some(handle)),
            None => (None, None),
        };
        let cache_opts = CacheOpts {
            cache_dir: self.cache_dir.clone(),
            remote_cache_read_only: self.opts.remote_cache_read_only,
            remote_cache_write_only: self.opts.remote_cache_write_only,
            skip_remote: self.remote_cache.is_none(),
            skip_filesystem: self.opts.remote_only,
            workers: 8,
            remote_cache_opts: self.remote_cache.as_ref().map(|remote| {
                convoy_cache::RemoteCacheOpts::new(remote.team_id.clone(), remote.signature)
            }),
        };
        let async_cache = AsyncCache::new(&cache_opts, &self.repo_root, api, analytics_sender)?;
        let run_cache = Arc::new(RunCache::new(
            async_cache,
            &self.repo_root,
            self.opts.run_cache_opts(),
        ));

        // 5. The scheduler
        let task_hasher = TaskHasher::new(
            package_inputs_hashes,
            &self.opts,
            &env_at_execution_start,
            &global_hash,
            self.global_config.global_pass_through_env.as_deref(),
        );
        let run_tracker = RunTracker::new(started_at, &env_at_execution_start);
        let manager = ProcessManager::new();

        let mut visitor = Visitor::new(
            self.package_graph.clone(),
            run_cache.clone(),
            run_tracker,
            task_hasher,
            &self.opts,
            self.color_config,
            manager.clone(),
            &self.repo_root,
        );
        if self.opts.dry_run {
            visitor.dry_run();
        }

        let engine = Arc::new(engine);

        // A signal stops new work, winds down children, and lets the
        // bounded shutdown below take over
        let subscriber = signal_handler.subscribe();
        let mut interrupted = false;
        let errors = {
            let visit = visitor.visit(engine.clone());
            tokio::pin!(visit);
            match subscriber {
                Some(subscriber) => {
                    tokio::select! {
                        biased;
                        _guard = subscriber.listen() => {
                            interrupted = true;
                            manager.stop().await;
                            // The walk unwinds once in-flight tasks settle
                            visit.await?
                        }
                        result = &mut visit => result?,
                    }
                }
                None => visit.await?,
            }
        };

        // 6. Wind down: close children, drain uploads, flush analytics
        manager.close().await;
        run_cache.shutdown_cache(UPLOAD_GRACE).await;
        if let Some(analytics_handle) = analytics_handle {
            analytics_handle.close_with_timeout().await;
        }

        let exit_code = if interrupted {
            INTERRUPT_EXIT_CODE
        } else if errors.is_empty() {
            0
        } else {
            1
        };

        // 7. Report
        visitor
            .finish(
                exit_code,
                interrupted,
                &engine,
                global_hash.clone(),
                &global_hash_inputs,
            )
            .await?;

        for error in &errors {
            warn!("{error}");
        }

        Ok(exit_code)
    }

    fn build_engine(&self) -> Result<Engine, Error> {
        let engine = EngineBuilder::new(&self.package_graph, &self.pipeline)
            .with_workspaces(self.filtered_packages.clone())
            .with_tasks(self.requested_tasks.iter().cloned())
            .with_root_tasks(self.requested_tasks.iter().cloned())
            .build()?;

        if !self.opts.parallel {
            engine
                .validate(&self.package_graph, self.opts.concurrency)
                .map_err(Error::Validation)?;
        }

        Ok(engine)
    }

    fn remote_cache_stack(
        &self,
    ) -> (
        Option<(APIClient, APIAuth)>,
        Option<(convoy_analytics::AnalyticsSender, AnalyticsHandle)>,
    ) {
        let Some(remote) = &self.remote_cache else {
            return (None, None);
        };
        let client = match APIClient::new(
            &remote.api_url,
            remote.timeout,
            env!("CARGO_PKG_VERSION"),
        ) {
            Ok(client) => client,
            Err(err) => {
                warn!("unable to construct remote cache client: {err}");
                return (None, None);
            }
        };
        let auth = APIAuth {
            token: remote.token.clone(),
            team_id: remote.team_id.clone(),
            team_slug: remote.team_slug.clone(),
        };

        // Cache usage analytics ride along with the remote tier; a
        // DO_NOT_TRACK environment opts out
        let analytics = if std::env::var_os("DO_NOT_TRACK").is_none() {
            Some(convoy_analytics::start_analytics(
                auth.clone(),
                client.clone(),
            ))
        } else {
            None
        };

        (Some((client, auth)), analytics)
    }
}

fn get_global_hash_inputs_for_run(
    run: &Run,
    scm: &SCM,
    env_at_execution_start: &EnvironmentVariableMap,
) -> Result<GlobalHashableInputs, global_hash::Error> {
    global_hash::get_global_hash_inputs(
        &run.repo_root,
        scm,
        run.package_graph.root_external_deps_hash(),
        &run.global_config.global_deps,
        env_at_execution_start,
        run.global_config.global_env.clone(),
        run.global_config.global_pass_through_env.clone(),
        run.opts.env_mode,
        run.opts.framework_inference,
        run.global_config.global_dot_env.clone(),
    )
}
