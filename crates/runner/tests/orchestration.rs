//! Two-round orchestration against scripted backends

use reprotest_common::{BuildCommand, BuildSpec, Error, Round, Verdict};
use reprotest_runner::{BuildRunner, RunnerConfig};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Answers every request without running anything. Artifact contents are
/// constant in `same` mode and unique per copy in `differ` mode; `fail`
/// makes every command exit 2 and `hangup` exits on the first command.
const FAKE_BACKEND: &str = r#"
caps="$1"; mode="$2"; log="$3"
n=0
echo ok
while read -r verb a b rest; do
  echo "$verb" >> "$log"
  case "$verb" in
    capabilities)
      if [ "$caps" = none ]; then echo ok; else echo "ok $caps"; fi ;;
    open) echo "ok s$$ /fake/scratch" ;;
    run)
      case "$mode" in
        fail) echo "exit 2" ;;
        hangup) exit 0 ;;
        *) echo "exit 0" ;;
      esac ;;
    copydown) echo ok ;;
    copyup)
      host=$(printf '%s' "$b" | sed 's|%2F|/|g')
      case "$a" in
        *reprotest-listing) printf './build/output.txt\000./build/notes.log\000./build-experiment/output.txt\000' > "$host" ;;
        *)
          n=$((n + 1))
          if [ "$mode" = differ ]; then
            printf 'artifact %s %s' "$$" "$n" > "$host"
          else
            printf 'artifact' > "$host"
          fi ;;
      esac
      echo ok ;;
    revert) echo "ok /fake/scratch" ;;
    close) echo ok; exit 0 ;;
    *) echo "error unknown request" ;;
  esac
done
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("backend.sh"), FAKE_BACKEND).unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/input.txt"), "hello").unwrap();
        Self { dir }
    }

    fn config(&self, caps: &str, mode: &str) -> RunnerConfig {
        let script = self.dir.path().join("backend.sh");
        let mut config = RunnerConfig::default();
        config.backend = vec![
            "command".to_string(),
            "sh".to_string(),
            script.display().to_string(),
            caps.to_string(),
            mode.to_string(),
            self.log_path().display().to_string(),
        ];
        config.staging_root = Some(self.dir.path().join("staging"));
        config.timeouts.startup_secs = 10;
        config.timeouts.operation_secs = 10;
        config.timeouts.copy_secs = 10;
        config.timeouts.kill_grace_millis = 200;
        config
    }

    fn spec(&self) -> BuildSpec {
        BuildSpec::new(
            BuildCommand::shell("cp input.txt output.txt"),
            self.dir.path().join("src"),
        )
        .with_artifact("output.txt")
    }

    fn log_path(&self) -> std::path::PathBuf {
        self.dir.path().join("requests.log")
    }

    fn requests(&self) -> Vec<String> {
        read_lines(&self.log_path())
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

fn count(requests: &[String], verb: &str) -> usize {
    requests.iter().filter(|r| *r == verb).count()
}

#[tokio::test]
async fn test_identical_rounds_pass_with_fresh_sessions() {
    let fixture = Fixture::new();
    let runner = BuildRunner::new(fixture.config("none", "same")).unwrap();

    let outcome = runner.run(&fixture.spec()).await.unwrap();
    assert_eq!(outcome.report.verdict, Verdict::Pass);
    assert!(outcome.staging.is_none());
    assert_eq!(outcome.rounds.len(), 2);
    assert!(outcome.rounds.iter().all(|r| !r.reverted && r.artifacts == 1));

    let requests = fixture.requests();
    assert_eq!(count(&requests, "open"), 2);
    assert_eq!(count(&requests, "close"), 2);
    assert_eq!(count(&requests, "revert"), 0);
}

#[tokio::test]
async fn test_revert_capable_backend_is_reused() {
    let fixture = Fixture::new();
    let runner = BuildRunner::new(fixture.config("revert", "same")).unwrap();

    let outcome = runner.run(&fixture.spec()).await.unwrap();
    assert_eq!(outcome.report.verdict, Verdict::Pass);
    assert!(outcome.rounds[1].reverted);

    let requests = fixture.requests();
    assert_eq!(count(&requests, "open"), 1);
    assert_eq!(count(&requests, "revert"), 1);
    assert_eq!(count(&requests, "close"), 1);
}

#[tokio::test]
async fn test_differing_artifacts_fail() {
    let fixture = Fixture::new();
    let mut config = fixture.config("revert", "differ");
    config.keep_staging = true;
    let runner = BuildRunner::new(config).unwrap();

    let outcome = runner
        .run(&fixture.spec().with_variations(["environment", "home"]))
        .await
        .unwrap();
    assert_eq!(outcome.report.verdict, Verdict::Fail);
    assert_eq!(outcome.variations, vec!["environment", "home"]);

    let artifact = &outcome.report.artifacts[0];
    assert_eq!(artifact.path, "output.txt");
    assert_eq!(artifact.verdict, Verdict::Fail);

    let kept = outcome.staging.unwrap();
    assert!(kept.join("a/output.txt").is_file());
    assert!(kept.join("b/output.txt").is_file());
}

#[tokio::test]
async fn test_unknown_variation_before_any_testbed() {
    let fixture = Fixture::new();
    let mut config = fixture.config("none", "same");
    config.backend = vec!["command".to_string(), "/nonexistent/backend".to_string()];
    let runner = BuildRunner::new(config).unwrap();

    let err = runner
        .run(&fixture.spec().with_variations(["no-such-variation"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownVariation(_)), "{err}");
}

#[tokio::test]
async fn test_conflicting_variations_rejected() {
    let fixture = Fixture::new();
    let runner = BuildRunner::new(fixture.config("none", "same")).unwrap();

    let err = runner
        .run(&fixture.spec().with_variations(["umask", "file-creation-mask"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VariationConflict { .. }), "{err}");
    assert!(fixture.requests().is_empty());
}

#[tokio::test]
async fn test_root_variation_needs_capability() {
    let fixture = Fixture::new();
    let runner = BuildRunner::new(fixture.config("none", "same")).unwrap();

    let err = runner
        .run(&fixture.spec().with_variations(["user-group"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedVariation { .. }), "{err}");

    let requests = fixture.requests();
    assert_eq!(count(&requests, "run"), 0);
    assert_eq!(count(&requests, "close"), 1);
}

#[tokio::test]
async fn test_build_failure_closes_session() {
    let fixture = Fixture::new();
    let runner = BuildRunner::new(fixture.config("none", "fail")).unwrap();

    let err = runner.run(&fixture.spec()).await.unwrap_err();
    match err {
        Error::BuildFailure { round, exit_code } => {
            assert_eq!(round, Round::A);
            assert_eq!(exit_code, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(count(&fixture.requests(), "close"), 1);
}

#[tokio::test]
async fn test_backend_hangup_is_protocol_error() {
    let fixture = Fixture::new();
    let runner = BuildRunner::new(fixture.config("none", "hangup")).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(10), runner.run(&fixture.spec()))
        .await
        .expect("hang-up was not detected in time")
        .unwrap_err();
    assert!(matches!(err, Error::BackendProtocol(_)), "{err}");
}

#[tokio::test]
async fn test_missing_artifact() {
    let fixture = Fixture::new();
    let runner = BuildRunner::new(fixture.config("none", "same")).unwrap();

    let err = runner
        .run(&fixture.spec().with_artifact("*.deb"))
        .await
        .unwrap_err();
    match err {
        Error::ArtifactNotFound { round, pattern } => {
            assert_eq!(round, Round::A);
            assert_eq!(pattern, "*.deb");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let fixture = Fixture::new();
    let runner = BuildRunner::new(fixture.config("none", "same")).unwrap();
    runner.cancellation_token().cancel();

    let err = runner.run(&fixture.spec()).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(fixture.requests().is_empty());
}
