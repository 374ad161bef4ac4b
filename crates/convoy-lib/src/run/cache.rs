use std::sync::Arc;

use convoy_cache::{AsyncCache, CacheError, CacheHitMetadata};
use convoy_engine::{workspace_relative_log_file, OutputLogsMode, TaskDefinition, TaskOutputs};
use convoy_repository::PackageInfo;
use convoy_task_id::TaskId;
use convoypath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use globset::{Glob, GlobSetBuilder};
use tracing::warn;

use crate::opts::RunCacheOpts;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Path(#[from] convoypath::PathError),
    #[error("invalid output glob: {0}")]
    Glob(#[from] globset::Error),
    #[error("unable to walk output files: {0}")]
    Walk(#[from] ignore::Error),
    #[error(transparent)]
    Ui(#[from] convoy_ui::Error),
}

/// Where task-level cache messages go. The scheduler provides an
/// implementation wired into the task's prefixed output.
pub trait CacheOutput {
    fn status(&mut self, message: &str);
    fn error(&mut self, message: &str);
    fn replay_logs(&mut self, log_file: &AbsoluteSystemPath) -> Result<(), convoy_ui::Error>;
}

/// Run-wide cache policy: the shared [`AsyncCache`] plus the read/write
/// switches derived from flags.
pub struct RunCache {
    task_output_logs_override: Option<OutputLogsMode>,
    cache: AsyncCache,
    reads_disabled: bool,
    writes_disabled: bool,
    repo_root: AbsoluteSystemPathBuf,
}

impl RunCache {
    pub fn new(cache: AsyncCache, repo_root: &AbsoluteSystemPath, opts: RunCacheOpts) -> Self {
        RunCache {
            task_output_logs_override: opts.task_output_logs_override,
            cache,
            reads_disabled: opts.skip_reads,
            writes_disabled: opts.skip_writes,
            repo_root: repo_root.to_owned(),
        }
    }

    /// The cache view for one task execution.
    pub fn task_cache(
        self: &Arc<Self>,
        task_definition: &TaskDefinition,
        workspace_info: &PackageInfo,
        task_id: TaskId<'static>,
        hash: &str,
    ) -> TaskCache {
        let workspace_dir = workspace_info.package_path();
        let repo_relative_globs = task_definition
            .outputs
            .repo_relative_hashable_outputs(&task_id, workspace_dir);

        let log_file_path = self
            .repo_root
            .resolve(workspace_dir)
            .resolve(&workspace_relative_log_file(task_id.task()));

        let task_output_logs = self
            .task_output_logs_override
            .unwrap_or(task_definition.output_logs);

        TaskCache {
            expanded_outputs: Vec::new(),
            run_cache: self.clone(),
            repo_relative_globs,
            hash: hash.to_string(),
            task_id,
            task_output_logs,
            // Persistent tasks have no meaningful outputs to replay
            caching_disabled: !task_definition.cache || task_definition.persistent,
            log_file_path,
        }
    }

    pub async fn shutdown_cache(&self, grace: std::time::Duration) {
        self.cache.wait_for_uploads(grace).await;
    }
}

/// One task's view of the cache: restore on hit, collect-and-store on miss.
pub struct TaskCache {
    expanded_outputs: Vec<AnchoredSystemPathBuf>,
    run_cache: Arc<RunCache>,
    repo_relative_globs: TaskOutputs,
    hash: String,
    task_id: TaskId<'static>,
    task_output_logs: OutputLogsMode,
    caching_disabled: bool,
    log_file_path: AbsoluteSystemPathBuf,
}

impl TaskCache {
    pub fn is_caching_disabled(&self) -> bool {
        self.caching_disabled
    }

    pub fn output_logs(&self) -> OutputLogsMode {
        self.task_output_logs
    }

    pub fn log_file_path(&self) -> &AbsoluteSystemPath {
        &self.log_file_path
    }

    /// Whether a task's live output should reach the terminal while it
    /// executes. The log file always captures everything.
    pub fn should_stream_outputs(&self) -> bool {
        matches!(
            self.task_output_logs,
            OutputLogsMode::Full | OutputLogsMode::NewOnly
        )
    }

    pub fn expanded_outputs(&self) -> &[AnchoredSystemPathBuf] {
        &self.expanded_outputs
    }

    /// Replays the captured log through `output`, for cache hits and for
    /// `errors-only` failures.
    pub fn replay_log_file(&self, output: &mut impl CacheOutput) -> Result<(), Error> {
        if self.log_file_path.exists() {
            output.replay_logs(&self.log_file_path)?;
        }
        Ok(())
    }

    /// Handles the terminal side of a task failure: under `errors-only` the
    /// suppressed log is finally replayed.
    pub fn on_error(&self, output: &mut impl CacheOutput) -> Result<(), Error> {
        if matches!(self.task_output_logs, OutputLogsMode::ErrorsOnly) {
            output.status(&format!(
                "cache miss, executing {}",
                self.hash
            ));
            self.replay_log_file(output)?;
        }
        Ok(())
    }

    /// Probes the cache without restoring. Used by dry runs.
    pub async fn exists(&self) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            return Ok(None);
        }
        Ok(self.run_cache.cache.exists(&self.hash).await?)
    }

    /// Attempts to restore the task's outputs. On a hit the declared
    /// outputs are overwritten from the archive and logs are replayed per
    /// the task's output mode.
    pub async fn restore_outputs(
        &mut self,
        output: &mut impl CacheOutput,
    ) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                output.status(&format!(
                    "cache bypass, force executing {}",
                    self.hash
                ));
            }
            return Ok(None);
        }

        let cache_status = self
            .run_cache
            .cache
            .fetch(&self.run_cache.repo_root, &self.hash)
            .await;

        let cache_status = match cache_status {
            Ok(cache_status) => cache_status,
            Err(err) => {
                // A cache read problem is a miss, never a failed task
                warn!("failed to fetch {} from cache: {err}", self.task_id);
                None
            }
        };

        let Some((cache_hit_metadata, restored_files)) = cache_status else {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                output.status(&format!("cache miss, executing {}", self.hash));
            }
            return Ok(None);
        };

        self.expanded_outputs = restored_files;

        match self.task_output_logs {
            OutputLogsMode::Full => {
                output.status(&format!("cache hit, replaying logs {}", self.hash));
                self.replay_log_file(output)?;
            }
            // The hit is worth a line, the logs are not
            OutputLogsMode::HashOnly | OutputLogsMode::NewOnly => {
                output.status(&format!("cache hit, suppressing logs {}", self.hash));
            }
            OutputLogsMode::ErrorsOnly | OutputLogsMode::None => {}
        }

        Ok(Some(cache_hit_metadata))
    }

    /// Archives the declared outputs plus the captured log.
    pub async fn save_outputs(
        &mut self,
        duration: u64,
        output: &mut impl CacheOutput,
    ) -> Result<(), Error> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }

        let files = self.expand_output_globs()?;

        if let Err(err) = self
            .run_cache
            .cache
            .put(
                self.run_cache.repo_root.clone(),
                self.hash.clone(),
                files.clone(),
                duration,
            )
            .await
        {
            // A failed write is a lost optimization, not a failed task
            output.error(&format!("error storing outputs in cache: {err}"));
            return Ok(());
        }

        self.expanded_outputs = files;
        Ok(())
    }

    // Walks the repository for files matching the declared output globs.
    // Standard ignore filters are off: build outputs are routinely
    // gitignored and must still be cached.
    fn expand_output_globs(&self) -> Result<Vec<AnchoredSystemPathBuf>, Error> {
        let mut inclusions = GlobSetBuilder::new();
        for glob in &self.repo_relative_globs.inclusions {
            inclusions.add(Glob::new(glob)?);
        }
        let inclusions = inclusions.build()?;

        let mut exclusions = GlobSetBuilder::new();
        for glob in &self.repo_relative_globs.exclusions {
            exclusions.add(Glob::new(glob)?);
        }
        let exclusions = exclusions.build()?;

        let mut files = Vec::new();
        let walker = ignore::WalkBuilder::new(self.run_cache.repo_root.as_std_path())
            .standard_filters(false)
            .hidden(false)
            .build();

        for entry in walker {
            let entry = entry?;
            let absolute = AbsoluteSystemPath::from_std_path(entry.path())?;
            let Ok(anchored) =
                AnchoredSystemPathBuf::new(&self.run_cache.repo_root, absolute)
            else {
                continue;
            };
            if anchored.as_str().is_empty() {
                continue;
            }
            let unix = anchored.to_unix();
            if !inclusions.is_match(unix.as_str()) {
                continue;
            }
            if exclusions.is_match(unix.as_str()) {
                continue;
            }
            files.push(anchored);
        }

        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use camino::Utf8PathBuf;
    use convoy_cache::CacheOpts;
    use convoy_engine::TaskDefinition;
    use convoy_repository::PackageJson;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct RecordingOutput {
        statuses: Vec<String>,
        errors: Vec<String>,
        replayed: Vec<u8>,
    }

    impl CacheOutput for RecordingOutput {
        fn status(&mut self, message: &str) {
            self.statuses.push(message.to_string());
        }

        fn error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }

        fn replay_logs(&mut self, log_file: &AbsoluteSystemPath) -> Result<(), convoy_ui::Error> {
            convoy_ui::replay_logs(&mut self.replayed, log_file)
        }
    }

    fn workspace_info(dir: &str) -> PackageInfo {
        PackageInfo {
            package_json: PackageJson::default(),
            package_path: AnchoredSystemPathBuf::from_raw(
                dir.replace('/', std::path::MAIN_SEPARATOR_STR),
            )
            .unwrap(),
            external_deps_hash: String::new(),
            framework: None,
        }
    }

    async fn test_run_cache(
        repo_root: &AbsoluteSystemPath,
        opts: RunCacheOpts,
    ) -> Result<Arc<RunCache>> {
        let cache = AsyncCache::new(
            &CacheOpts {
                cache_dir: Utf8PathBuf::from(".convoy/cache"),
                workers: 1,
                ..Default::default()
            },
            repo_root,
            None,
            None,
        )?;
        Ok(Arc::new(RunCache::new(cache, repo_root, opts)))
    }

    fn build_definition() -> TaskDefinition {
        TaskDefinition {
            outputs: convoy_engine::TaskOutputs {
                inclusions: vec!["dist/**".to_string()],
                exclusions: vec!["dist/**/*.map".to_string()],
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let pkg_dir = repo_root.join_components(&["packages", "util"]);
        pkg_dir.join_component("dist").create_dir_all()?;
        pkg_dir
            .join_components(&["dist", "index.js"])
            .create_with_contents(b"built")?;
        pkg_dir
            .join_components(&["dist", "index.js.map"])
            .create_with_contents(b"sourcemap")?;

        let run_cache = test_run_cache(&repo_root, RunCacheOpts::default()).await?;
        let task_id = TaskId::new("util", "build").into_owned();
        let mut task_cache = run_cache.task_cache(
            &build_definition(),
            &workspace_info("packages/util"),
            task_id.clone(),
            "deadbeefdeadbeef",
        );

        // Write a log as the executor would
        task_cache.log_file_path().ensure_dir()?;
        task_cache
            .log_file_path()
            .create_with_contents(b"compiled ok\n")?;

        let mut output = RecordingOutput::default();
        let miss = task_cache.restore_outputs(&mut output).await?;
        assert!(miss.is_none());
        assert_eq!(
            output.statuses,
            vec!["cache miss, executing deadbeefdeadbeef"]
        );

        task_cache.save_outputs(10, &mut output).await?;
        let saved: Vec<_> = task_cache
            .expanded_outputs()
            .iter()
            .map(|p| p.to_unix().into_string())
            .collect();
        // The sourcemap is excluded; the log is part of the artifact
        assert_eq!(
            saved,
            vec![
                "packages/util/.convoy/convoy-build.log",
                "packages/util/dist/index.js"
            ]
        );

        // Wipe the outputs, then restore from cache
        pkg_dir.join_component("dist").remove_dir_all()?;
        let mut task_cache = run_cache.task_cache(
            &build_definition(),
            &workspace_info("packages/util"),
            task_id,
            "deadbeefdeadbeef",
        );
        let mut output = RecordingOutput::default();
        let hit = task_cache.restore_outputs(&mut output).await?;
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().time_saved, 10);
        assert_eq!(
            pkg_dir
                .join_components(&["dist", "index.js"])
                .read_to_string()?,
            "built"
        );
        assert!(
            !pkg_dir.join_components(&["dist", "index.js.map"]).exists(),
            "excluded outputs must not be restored"
        );
        assert_eq!(
            output.statuses,
            vec!["cache hit, replaying logs deadbeefdeadbeef"]
        );
        assert_eq!(output.replayed, b"compiled ok\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_force_bypasses_reads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;

        let run_cache = test_run_cache(
            &repo_root,
            RunCacheOpts {
                skip_reads: true,
                ..Default::default()
            },
        )
        .await?;
        let mut task_cache = run_cache.task_cache(
            &build_definition(),
            &workspace_info("packages/util"),
            TaskId::new("util", "build").into_owned(),
            "cafebabecafebabe",
        );

        let mut output = RecordingOutput::default();
        let result = task_cache.restore_outputs(&mut output).await?;
        assert!(result.is_none());
        assert_eq!(
            output.statuses,
            vec!["cache bypass, force executing cafebabecafebabe"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_disabled_task_never_stores() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;

        let run_cache = test_run_cache(&repo_root, RunCacheOpts::default()).await?;
        let definition = TaskDefinition {
            cache: false,
            ..build_definition()
        };
        let mut task_cache = run_cache.task_cache(
            &definition,
            &workspace_info("packages/util"),
            TaskId::new("util", "dev").into_owned(),
            "0123456789abcdef",
        );

        let mut output = RecordingOutput::default();
        task_cache.save_outputs(5, &mut output).await?;
        assert!(task_cache.exists().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_only_suppresses_replay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let pkg_dir = repo_root.join_components(&["packages", "util"]);
        pkg_dir.create_dir_all()?;

        let run_cache = test_run_cache(&repo_root, RunCacheOpts::default()).await?;
        let definition = TaskDefinition {
            output_logs: OutputLogsMode::HashOnly,
            ..build_definition()
        };
        let task_id = TaskId::new("util", "build").into_owned();
        let mut task_cache = run_cache.task_cache(
            &definition,
            &workspace_info("packages/util"),
            task_id.clone(),
            "1111222233334444",
        );
        task_cache.log_file_path().ensure_dir()?;
        task_cache
            .log_file_path()
            .create_with_contents(b"noisy output\n")?;

        let mut output = RecordingOutput::default();
        task_cache.restore_outputs(&mut output).await?;
        task_cache.save_outputs(1, &mut output).await?;

        let mut task_cache = run_cache.task_cache(
            &definition,
            &workspace_info("packages/util"),
            task_id,
            "1111222233334444",
        );
        let mut output = RecordingOutput::default();
        let hit = task_cache.restore_outputs(&mut output).await?;
        assert!(hit.is_some());
        assert_eq!(
            output.statuses,
            vec!["cache hit, suppressing logs 1111222233334444"]
        );
        assert!(output.replayed.is_empty());
        Ok(())
    }
}
