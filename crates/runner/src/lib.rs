//! reprotest runner
//!
//! Drives a testbed backend over the line-oriented control protocol, runs a
//! build twice under the variations of an execution plan, stages the
//! artifacts of both rounds on the host and compares them.
//!
//! ```text
//! BuildRunner::run(spec)
//!   ├── VariationCatalog::resolve     -> ExecutionPlan
//!   ├── round A / round B
//!   │     ├── TestbedSession::open | revert
//!   │     ├── copy_in, init steps, wrapped build
//!   │     └── ArtifactCollector::collect -> ArtifactSet
//!   └── DiffEngine::compare           -> DiffReport
//! ```

pub mod backend;
pub mod collector;
pub mod config;
pub mod runner;
pub mod staging;
pub mod testbed;

pub use backend::{BackendKind, BackendSpec};
pub use collector::ArtifactCollector;
pub use config::{RunnerConfig, TimeoutConfig};
pub use runner::{BuildRunner, RoundSummary, RunOutcome};
pub use staging::StagingArea;
pub use testbed::{SessionOptions, TestbedSession};
