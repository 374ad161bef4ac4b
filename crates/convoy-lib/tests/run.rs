//! End-to-end runs against a scratch repository: real processes, real
//! cache directory, summaries read back from disk.

#![cfg(unix)]

use std::collections::BTreeMap;

use anyhow::Result;
use convoy_engine::{Pipeline, TaskDefinition, TaskOutputs};
use convoy_lib::{GlobalConfig, RunBuilder, RunOpts, SignalHandler};
use convoy_repository::{PackageGraph, PackageJson};
use convoy_task_id::TaskName;
use convoypath::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

struct TestRepo {
    _dir: tempfile::TempDir,
    root: AbsoluteSystemPathBuf,
}

impl TestRepo {
    /// Two packages: `app` depends on `util`; both define a `build` script
    /// that writes `dist/out.txt`.
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;

        for package in ["util", "app"] {
            let package_dir = root.join_components(&["packages", package]);
            package_dir.join_component("src").create_dir_all()?;
            package_dir
                .join_components(&["src", "index.ts"])
                .create_with_contents(format!("export const name = \"{package}\";"))?;
        }

        Ok(Self { _dir: dir, root })
    }

    fn package_json(&self, name: &str, deps: &[&str], scripts: &[(&str, &str)]) -> PackageJson {
        PackageJson {
            name: Some(name.to_string()),
            scripts: scripts
                .iter()
                .map(|(task, script)| (task.to_string(), script.to_string()))
                .collect(),
            dependencies: Some(
                deps.iter()
                    .map(|dep| (dep.to_string(), "workspace:*".to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn package_graph(&self, scripts: &[(&str, &str)]) -> Result<PackageGraph> {
        Ok(PackageGraph::builder(PackageJson::default())
            .with_package(
                "util",
                self.package_json("util", &[], scripts),
                AnchoredSystemPathBuf::from_raw(
                    ["packages", "util"].join(std::path::MAIN_SEPARATOR_STR),
                )?,
                "util-external",
            )
            .with_package(
                "app",
                self.package_json("app", &["util"], scripts),
                AnchoredSystemPathBuf::from_raw(
                    ["packages", "app"].join(std::path::MAIN_SEPARATOR_STR),
                )?,
                "app-external",
            )
            .build()?)
    }

    fn build_pipeline() -> Pipeline {
        let mut pipeline = Pipeline::default();
        pipeline.insert(
            TaskName::from("build".to_string()),
            TaskDefinition {
                outputs: TaskOutputs {
                    inclusions: vec!["dist/**".to_string()],
                    exclusions: vec![],
                },
                ..TaskDefinition::default()
            }
            .with_depends_on(&["^build"]),
        );
        pipeline
    }

    async fn run_build(
        &self,
        scripts: &[(&str, &str)],
        pipeline: Pipeline,
        opts: RunOpts,
    ) -> Result<i32> {
        let run = RunBuilder::new(
            self.root.clone(),
            self.package_graph(scripts)?,
            pipeline,
            opts,
        )
        .with_tasks(vec![TaskName::from("build".to_string())])
        .with_global_config(GlobalConfig::default())
        .build();

        let handler = SignalHandler::without_signal_source();
        Ok(run.run(&handler).await?)
    }

    /// Parses the most recent run summary from `.convoy/runs`.
    fn latest_summary(&self) -> Result<serde_json::Value> {
        let runs_dir = self.root.join_components(&[".convoy", "runs"]);
        let mut entries: Vec<_> = runs_dir
            .read_dir()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        // Run ids are time-sortable, so the path ordering is run ordering
        entries.sort();
        let latest = entries.last().expect("at least one summary");
        Ok(serde_json::from_str(&std::fs::read_to_string(latest)?)?)
    }
}

fn summarizing_opts() -> RunOpts {
    RunOpts {
        summarize: true,
        ..RunOpts::default()
    }
}

const BUILD_SCRIPT: &str = "mkdir -p dist && echo output > dist/out.txt";

#[tokio::test]
async fn test_basic_cached_rebuild() -> Result<()> {
    let repo = TestRepo::new()?;
    let scripts = [("build", BUILD_SCRIPT)];

    // First run: two misses, both successful
    let exit = repo
        .run_build(&scripts, TestRepo::build_pipeline(), summarizing_opts())
        .await?;
    assert_eq!(exit, 0);
    let summary = repo.latest_summary()?;
    assert_eq!(summary["execution"]["attempted"], 2);
    assert_eq!(summary["execution"]["success"], 2);
    assert_eq!(summary["execution"]["cached"], 0);

    assert!(repo
        .root
        .join_components(&["packages", "util", "dist", "out.txt"])
        .exists());

    // Second run: both replayed from cache
    let exit = repo
        .run_build(&scripts, TestRepo::build_pipeline(), summarizing_opts())
        .await?;
    assert_eq!(exit, 0);
    let summary = repo.latest_summary()?;
    assert_eq!(summary["execution"]["attempted"], 2);
    assert_eq!(summary["execution"]["cached"], 2);
    assert_eq!(summary["execution"]["success"], 0);

    for task in summary["tasks"].as_array().unwrap() {
        assert_eq!(task["cache"]["status"], "HIT");
    }
    Ok(())
}

#[tokio::test]
async fn test_input_change_invalidates_dependents() -> Result<()> {
    let repo = TestRepo::new()?;
    let scripts = [("build", BUILD_SCRIPT)];

    repo.run_build(&scripts, TestRepo::build_pipeline(), summarizing_opts())
        .await?;

    // Touch a source file in util; both util and its dependent must miss
    repo.root
        .join_components(&["packages", "util", "src", "index.ts"])
        .create_with_contents("export const name = \"changed\";")?;

    let exit = repo
        .run_build(&scripts, TestRepo::build_pipeline(), summarizing_opts())
        .await?;
    assert_eq!(exit, 0);
    let summary = repo.latest_summary()?;
    assert_eq!(summary["execution"]["cached"], 0);
    assert_eq!(summary["execution"]["success"], 2);
    Ok(())
}

#[tokio::test]
async fn test_unrelated_package_stays_cached() -> Result<()> {
    let repo = TestRepo::new()?;
    let scripts = [("build", BUILD_SCRIPT)];

    repo.run_build(&scripts, TestRepo::build_pipeline(), summarizing_opts())
        .await?;

    // app has no dependents; changing it leaves util's entry valid
    repo.root
        .join_components(&["packages", "app", "src", "index.ts"])
        .create_with_contents("export const name = \"changed\";")?;

    repo.run_build(&scripts, TestRepo::build_pipeline(), summarizing_opts())
        .await?;
    let summary = repo.latest_summary()?;
    assert_eq!(summary["execution"]["cached"], 1);
    assert_eq!(summary["execution"]["success"], 1);
    Ok(())
}

#[tokio::test]
async fn test_force_reruns_everything() -> Result<()> {
    let repo = TestRepo::new()?;
    let scripts = [("build", BUILD_SCRIPT)];

    repo.run_build(&scripts, TestRepo::build_pipeline(), summarizing_opts())
        .await?;

    let opts = RunOpts {
        force: true,
        ..summarizing_opts()
    };
    repo.run_build(&scripts, TestRepo::build_pipeline(), opts)
        .await?;
    let summary = repo.latest_summary()?;
    assert_eq!(summary["execution"]["cached"], 0);
    assert_eq!(summary["execution"]["success"], 2);
    Ok(())
}

#[tokio::test]
async fn test_persistent_dependency_rejected_before_execution() -> Result<()> {
    let repo = TestRepo::new()?;
    let scripts = [("build", BUILD_SCRIPT), ("dev", "sleep 60")];

    let mut pipeline = Pipeline::default();
    pipeline.insert(
        TaskName::from("dev".to_string()),
        TaskDefinition {
            persistent: true,
            cache: false,
            ..TaskDefinition::default()
        },
    );
    pipeline.insert(
        TaskName::from("build".to_string()),
        TaskDefinition::default().with_depends_on(&["dev"]),
    );

    let result = repo
        .run_build(&scripts, pipeline, RunOpts::default())
        .await;
    let message = result.unwrap_err().to_string();
    assert!(
        message.contains("persistent task"),
        "expected persistent task rejection, got: {message}"
    );
    // Validation failed before anything executed
    assert!(!repo
        .root
        .join_components(&["packages", "util", "dist"])
        .exists());
    Ok(())
}

#[tokio::test]
async fn test_failed_task_fails_run() -> Result<()> {
    let repo = TestRepo::new()?;
    let scripts = [("build", "echo failing && exit 3")];

    let exit = repo
        .run_build(&scripts, TestRepo::build_pipeline(), summarizing_opts())
        .await?;
    assert_eq!(exit, 1);
    let summary = repo.latest_summary()?;
    assert!(summary["execution"]["failed"].as_u64().unwrap() >= 1);
    Ok(())
}

#[tokio::test]
async fn test_continue_runs_siblings_and_skips_dependents() -> Result<()> {
    let repo = TestRepo::new()?;
    // util fails; app (its dependent) must be skipped, not run
    let scripts = [("build", "test \"$(basename $(pwd))\" != util || exit 1")];

    let opts = RunOpts {
        continue_on_error: true,
        ..summarizing_opts()
    };
    let exit = repo
        .run_build(&scripts, TestRepo::build_pipeline(), opts)
        .await?;
    assert_eq!(exit, 1);

    let summary = repo.latest_summary()?;
    let tasks = summary["tasks"].as_array().unwrap();
    let state_of = |task_id: &str| {
        tasks
            .iter()
            .find(|task| task["taskId"] == task_id)
            .and_then(|task| task["execution"]["execution"]["state"].as_str())
            .map(str::to_string)
    };
    assert_eq!(state_of("util#build").as_deref(), Some("buildFailed"));
    assert_eq!(state_of("app#build").as_deref(), Some("skipped"));
    Ok(())
}

#[tokio::test]
async fn test_failed_tasks_never_cached() -> Result<()> {
    let repo = TestRepo::new()?;
    let failing = [("build", "exit 1")];
    repo.run_build(&failing, TestRepo::build_pipeline(), summarizing_opts())
        .await?;

    let cache_dir = repo.root.join_components(&[".convoy", "cache"]);
    if cache_dir.exists() {
        let archives: Vec<_> = cache_dir
            .read_dir()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tar.zst")
            })
            .collect();
        assert!(archives.is_empty(), "failed tasks must not populate the cache");
    }
    Ok(())
}

#[tokio::test]
async fn test_dry_run_executes_nothing() -> Result<()> {
    let repo = TestRepo::new()?;
    let scripts = [("build", BUILD_SCRIPT)];

    let opts = RunOpts {
        dry_run: true,
        ..summarizing_opts()
    };
    let exit = repo
        .run_build(&scripts, TestRepo::build_pipeline(), opts)
        .await?;
    assert_eq!(exit, 0);
    assert!(
        !repo
            .root
            .join_components(&["packages", "util", "dist"])
            .exists(),
        "dry runs must not execute tasks"
    );

    let summary = repo.latest_summary()?;
    assert_eq!(summary["tasks"].as_array().unwrap().len(), 2);
    Ok(())
}
