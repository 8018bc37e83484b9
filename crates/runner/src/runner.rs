//! Two-round build orchestration

use crate::backend::BackendSpec;
use crate::collector::ArtifactCollector;
use crate::config::RunnerConfig;
use crate::staging::StagingArea;
use crate::testbed::{SessionOptions, TestbedSession};
use reprotest_common::wrapper::Step;
use reprotest_common::{
    ArtifactSet, BuildSpec, DiffEngine, DiffReport, Error, ExecutionPlan, ExecutionResult,
    Invocation, Result, Round, RoundPaths, SessionState, VariationCatalog,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened in one round
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub round: Round,
    pub tree: String,
    pub reverted: bool,
    pub build_duration_ms: u64,
    pub artifacts: usize,
}

/// Result of a completed invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub report: DiffReport,
    pub variations: Vec<String>,
    pub rounds: Vec<RoundSummary>,
    /// Staging directory left in place for inspection
    pub staging: Option<PathBuf>,
}

/// Builds twice under the variations of a plan and compares the artifacts
pub struct BuildRunner {
    config: RunnerConfig,
    backend: BackendSpec,
    catalog: VariationCatalog,
    cancel: CancellationToken,
}

impl BuildRunner {
    /// Create a runner with the built-in variation catalog
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let backend = BackendSpec::parse(&config.backend)?;
        Ok(Self {
            config,
            backend,
            catalog: VariationCatalog::builtin(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_catalog(mut self, catalog: VariationCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Token that aborts an in-flight run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Resolve the variations of `spec` without touching any testbed
    pub fn plan(&self, spec: &BuildSpec) -> Result<ExecutionPlan> {
        self.catalog.resolve(&spec.variations)
    }

    /// Run both rounds and compare their artifacts.
    pub async fn run(&self, spec: &BuildSpec) -> Result<RunOutcome> {
        validate(spec)?;
        let plan = self.plan(spec)?;
        let collector = ArtifactCollector::new(&spec.artifacts)?;
        for round in Round::ALL {
            collector.matchers(plan.tree_name(round))?;
        }
        info!(
            "Variations: {}",
            if plan.is_empty() {
                "none".to_string()
            } else {
                plan.names().join(", ")
            }
        );

        let staging =
            StagingArea::create(self.config.staging_root.as_deref(), self.config.keep_staging)?;
        debug!("Staging artifacts in {}", staging.path().display());

        let mut session: Option<TestbedSession> = None;
        let rounds = self
            .run_rounds(spec, &plan, &collector, &staging, &mut session)
            .await;

        if let Some(session) = session.as_mut() {
            if let Err(e) = session.close().await {
                warn!("Failed to close testbed session: {}", e);
            }
        }

        let (sets, rounds) = rounds?;
        let engine = DiffEngine::new(self.config.diff.clone());
        let report = engine.compare(&sets[0], &sets[1]);
        info!("Verdict: {}", report.verdict);

        Ok(RunOutcome {
            report,
            variations: plan.names().into_iter().map(String::from).collect(),
            rounds,
            staging: staging.finish(),
        })
    }

    async fn run_rounds(
        &self,
        spec: &BuildSpec,
        plan: &ExecutionPlan,
        collector: &ArtifactCollector,
        staging: &StagingArea,
        slot: &mut Option<TestbedSession>,
    ) -> Result<(Vec<ArtifactSet>, Vec<RoundSummary>)> {
        let mut sets = Vec::with_capacity(2);
        let mut summaries = Vec::with_capacity(2);

        for round in Round::ALL {
            self.check_cancelled()?;
            let reverted = self.prepare_session(spec, slot).await?;
            let session = slot
                .as_mut()
                .ok_or_else(|| Error::Internal("no testbed session for round".to_string()))?;
            plan.check_capabilities(session.capabilities())?;

            info!("Round {}: starting", round);
            let (set, build) = self
                .run_round(round, spec, plan, collector, staging, session)
                .await?;

            summaries.push(RoundSummary {
                round,
                tree: plan.tree_name(round).to_string(),
                reverted,
                build_duration_ms: build.duration.as_millis() as u64,
                artifacts: set.len(),
            });
            sets.push(set);
        }

        Ok((sets, summaries))
    }

    /// Make `slot` hold an open, pristine session. Returns whether an
    /// existing session was reverted instead of opening a new one.
    async fn prepare_session(
        &self,
        spec: &BuildSpec,
        slot: &mut Option<TestbedSession>,
    ) -> Result<bool> {
        if let Some(session) = slot.as_mut() {
            if self.config.reuse_session && session.capabilities().supports_revert() {
                session.revert().await?;
                return Ok(true);
            }
            info!("Opening a fresh testbed session");
            session.close().await?;
        }

        let argv = self
            .backend
            .argv(&self.config.null_program, &spec.backend_args);
        debug!("Starting backend: {}", argv.join(" "));
        // Stored before opening so a failed open is still torn down.
        let session = slot.insert(TestbedSession::new(
            argv,
            SessionOptions::from_config(&self.config),
            self.cancel.clone(),
        ));
        session.open().await?;
        Ok(false)
    }

    async fn run_round(
        &self,
        round: Round,
        spec: &BuildSpec,
        plan: &ExecutionPlan,
        collector: &ArtifactCollector,
        staging: &StagingArea,
        session: &mut TestbedSession,
    ) -> Result<(ArtifactSet, ExecutionResult)> {
        let paths = RoundPaths::new(session.scratch()?, plan.tree_name(round));
        let operation = Some(self.config.timeouts.operation());

        debug!("Round {}: copying {} to {}", round, spec.source_root.display(), paths.tree);
        session.copy_in(&spec.source_root, &paths.tree).await?;

        if let Some(init) = &spec.init_command {
            let invocation = Invocation {
                argv: init.to_argv(),
                env: spec.env.clone(),
                cwd: paths.tree.clone(),
            };
            let result = session.execute(&invocation, operation).await?;
            if !result.success() {
                log_output(round, &result);
                return Err(Error::BuildFailure {
                    round,
                    exit_code: result.exit_code,
                });
            }
        }

        for step in plan.init_steps(round) {
            self.check_cancelled()?;
            run_step(session, step, &paths, operation).await?;
        }

        let outcome = self
            .build_and_collect(round, spec, plan, collector, staging, session, &paths)
            .await;

        for step in plan.cleanup_steps(round) {
            if session.state() != SessionState::Open {
                break;
            }
            if let Err(e) = run_step(session, step, &paths, operation).await {
                warn!("Round {}: cleanup step failed: {}", round, e);
            }
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_and_collect(
        &self,
        round: Round,
        spec: &BuildSpec,
        plan: &ExecutionPlan,
        collector: &ArtifactCollector,
        staging: &StagingArea,
        session: &mut TestbedSession,
        paths: &RoundPaths,
    ) -> Result<(ArtifactSet, ExecutionResult)> {
        self.check_cancelled()?;
        let invocation = plan
            .wrapper(round)
            .apply(&spec.command.to_argv(), &spec.env, paths);
        info!("Round {}: building in {}", round, invocation.cwd);
        debug!("Round {}: {}", round, invocation.argv.join(" "));

        let started = Instant::now();
        let result = session
            .execute(&invocation, self.config.timeouts.round())
            .await?;
        for line in &result.output.lines {
            debug!(target: "build", "{}", line);
        }
        if !result.success() {
            log_output(round, &result);
            return Err(Error::BuildFailure {
                round,
                exit_code: result.exit_code,
            });
        }
        info!(
            "Round {}: build finished in {:.1}s",
            round,
            started.elapsed().as_secs_f64()
        );

        let work_dir = staging.work_dir(round)?;
        let set = collector
            .collect(session, round, plan.tree_name(round), &work_dir, &staging.round_dir(round))
            .await?;
        Ok((set, result))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn validate(spec: &BuildSpec) -> Result<()> {
    if spec.command.is_empty() {
        return Err(Error::InvalidConfig("empty build command".to_string()));
    }
    if spec.artifacts.is_empty() {
        return Err(Error::InvalidConfig("no artifact patterns given".to_string()));
    }
    if !spec.source_root.is_dir() {
        return Err(Error::InvalidConfig(format!(
            "source root {} is not a directory",
            spec.source_root.display()
        )));
    }
    Ok(())
}

async fn run_step(
    session: &mut TestbedSession,
    step: &Step,
    paths: &RoundPaths,
    deadline: Option<Duration>,
) -> Result<()> {
    let (argv, cwd) = step.resolve(paths);
    let invocation = Invocation {
        argv,
        env: Default::default(),
        cwd,
    };
    let result = session.execute(&invocation, deadline).await?;
    if result.success() {
        Ok(())
    } else {
        Err(Error::BackendFailure {
            verb: "run".to_string(),
            message: format!(
                "`{}` exited with code {}",
                invocation.argv.join(" "),
                result.exit_code
            ),
        })
    }
}

fn log_output(round: Round, result: &ExecutionResult) {
    warn!(
        "Round {}: command exited with code {}",
        round, result.exit_code
    );
    for line in &result.output.lines {
        warn!(target: "build", "{}", line);
    }
}
