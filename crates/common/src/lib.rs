//! reprotest common library
//!
//! Shared types, the testbed control protocol, the variation catalog and the
//! artifact diff engine.

pub mod archive;
pub mod diff;
pub mod error;
pub mod protocol;
pub mod types;
pub mod variation;
pub mod wrapper;

// Re-export commonly used types
pub use diff::{DiffConfig, DiffEngine, DiffReport, Difference, Verdict};
pub use error::{Error, ErrorKind, Failure, Result};
pub use types::*;
pub use variation::{ExecutionPlan, Variation, VariationCatalog};
pub use wrapper::{Invocation, RoundPaths, Wrapper};

/// reprotest version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
