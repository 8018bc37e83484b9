//! End-to-end runs against the null backend

use reprotest_common::{BuildCommand, BuildSpec, Error, Verdict};
use reprotest_runner::{BuildRunner, RunnerConfig};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn config(dir: &Path) -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.null_program = PathBuf::from(env!("CARGO_BIN_EXE_reprotest-virt-null"));
    config.staging_root = Some(dir.join("staging"));
    config.timeouts.round_secs = Some(60);
    config
}

fn source_tree(dir: &Path) -> PathBuf {
    let src = dir.join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("input.txt"), "the same every time\n").unwrap();
    src
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

#[tokio::test]
async fn test_copy_is_reproducible() {
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(
        BuildCommand::shell("cp input.txt output.txt"),
        source_tree(dir.path()),
    )
    .with_artifact("output.txt")
    .with_variations(["file-creation-mask"]);

    let runner = BuildRunner::new(config(dir.path())).unwrap();
    let outcome = runner.run(&spec).await.unwrap();

    assert_eq!(outcome.report.verdict, Verdict::Pass);
    assert!(outcome.report.differences().is_empty());
    assert!(outcome.rounds[1].reverted);
    assert!(outcome.staging.is_none());
}

#[tokio::test]
async fn test_fresh_session_per_round() {
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(
        BuildCommand::argv(["cp", "input.txt", "output.txt"]),
        source_tree(dir.path()),
    )
    .with_artifact("*.txt")
    .with_variations(["environment", "home", "exec-path"]);

    let mut config = config(dir.path());
    config.reuse_session = false;
    let runner = BuildRunner::new(config).unwrap();
    let outcome = runner.run(&spec).await.unwrap();

    assert_eq!(outcome.report.verdict, Verdict::Pass);
    assert!(outcome.rounds.iter().all(|r| !r.reverted && r.artifacts == 2));
}

#[tokio::test]
async fn test_timezone_leak_is_detected() {
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(
        BuildCommand::shell("date +%H > output.txt"),
        source_tree(dir.path()),
    )
    .with_artifact("output.txt")
    .with_variations(["timezone"]);

    let runner = BuildRunner::new(config(dir.path())).unwrap();
    let outcome = runner.run(&spec).await.unwrap();

    assert_eq!(outcome.report.verdict, Verdict::Fail);
    let paths: Vec<&str> = outcome
        .report
        .differences()
        .iter()
        .map(|a| a.path.as_str())
        .collect();
    assert_eq!(paths, vec!["output.txt"]);
}

#[tokio::test]
async fn test_wall_clock_leak_is_detected() {
    if !on_path("faketime") {
        eprintln!("skipping: faketime is not installed");
        return;
    }
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(
        BuildCommand::shell("date +%Y-%m-%d > output.txt"),
        source_tree(dir.path()),
    )
    .with_artifact("output.txt")
    .with_variations(["time"]);

    let runner = BuildRunner::new(config(dir.path())).unwrap();
    let outcome = runner.run(&spec).await.unwrap();

    assert_eq!(outcome.report.verdict, Verdict::Fail);
    assert_eq!(outcome.report.artifacts[0].path, "output.txt");
}

#[tokio::test]
async fn test_build_path_and_init_command() {
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(BuildCommand::shell("pwd > where.txt"), source_tree(dir.path()))
        .with_init_command(BuildCommand::shell("test -f input.txt"))
        .with_artifact("where.txt")
        .with_variations(["build-path"]);

    let mut config = config(dir.path());
    config.keep_staging = true;
    let runner = BuildRunner::new(config).unwrap();
    let outcome = runner.run(&spec).await.unwrap();

    assert_eq!(outcome.report.verdict, Verdict::Fail);
    let kept = outcome.staging.unwrap();
    let a = std::fs::read_to_string(kept.join("a/where.txt")).unwrap();
    let b = std::fs::read_to_string(kept.join("b/where.txt")).unwrap();
    assert!(a.trim_end().ends_with("/build"), "{a}");
    assert!(b.trim_end().ends_with("/build-experiment"), "{b}");
}

#[tokio::test]
async fn test_failing_build() {
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(BuildCommand::shell("exit 4"), source_tree(dir.path()))
        .with_artifact("output.txt");

    let runner = BuildRunner::new(config(dir.path())).unwrap();
    let err = runner.run(&spec).await.unwrap_err();
    assert!(matches!(err, Error::BuildFailure { exit_code: 4, .. }), "{err}");
}

#[tokio::test]
async fn test_round_deadline() {
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(BuildCommand::shell("sleep 30"), source_tree(dir.path()))
        .with_artifact("output.txt");

    let mut config = config(dir.path());
    config.timeouts.round_secs = Some(1);
    config.timeouts.kill_grace_millis = 200;
    let runner = BuildRunner::new(config).unwrap();

    let started = std::time::Instant::now();
    let err = runner.run(&spec).await.unwrap_err();
    assert!(matches!(err, Error::TimedOut { .. }), "{err}");
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
}

#[tokio::test]
async fn test_symlink_artifacts_compare_by_target() {
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(
        BuildCommand::shell("cp input.txt data.bin && ln -s data.bin out.link"),
        source_tree(dir.path()),
    )
    .with_artifact("*.link");

    let runner = BuildRunner::new(config(dir.path())).unwrap();
    let outcome = runner.run(&spec).await.unwrap();

    assert_eq!(outcome.report.verdict, Verdict::Pass, "{:?}", outcome.report);
    assert_eq!(outcome.report.artifacts[0].path, "out.link");
}

#[tokio::test]
async fn test_artifact_in_parent_directory() {
    let dir = TempDir::new().unwrap();
    let spec = BuildSpec::new(
        BuildCommand::shell("cp input.txt ../out.deb"),
        source_tree(dir.path()),
    )
    .with_artifact("../*.deb")
    .with_variations(["build-path"]);

    let mut config = config(dir.path());
    config.keep_staging = true;
    let runner = BuildRunner::new(config).unwrap();
    let outcome = runner.run(&spec).await.unwrap();

    assert_eq!(outcome.report.verdict, Verdict::Pass, "{:?}", outcome.report);
    assert_eq!(outcome.report.artifacts[0].path, "../out.deb");
    let kept = outcome.staging.unwrap();
    assert!(kept.join("a/_parent/out.deb").is_file());
    assert!(kept.join("b/_parent/out.deb").is_file());
}

#[tokio::test]
async fn test_cancel_during_build_tears_down_testbed() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("where");
    let spec = BuildSpec::new(
        BuildCommand::shell(format!("pwd > '{}'; sleep 30", marker.display())),
        source_tree(dir.path()),
    )
    .with_artifact("output.txt");

    let runner = BuildRunner::new(config(dir.path())).unwrap();
    let cancel = runner.cancellation_token();

    let watched = marker.clone();
    tokio::spawn(async move {
        for _ in 0..200 {
            if watched.is_file() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = runner.run(&spec).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{err}");
    assert!(started.elapsed() < std::time::Duration::from_secs(20));

    let tree = PathBuf::from(std::fs::read_to_string(&marker).unwrap().trim_end());
    let scratch = tree.parent().unwrap();
    assert!(!scratch.exists(), "{} was left behind", scratch.display());
}
