//! Error types for reprotest

use crate::types::Round;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the reprotest Error
pub type Result<T> = std::result::Result<T, Error>;

/// reprotest error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),

    #[error("Backend reported failure for `{verb}`: {message}")]
    BackendFailure { verb: String, message: String },

    #[error("Build failed in round {round} with exit code {exit_code}")]
    BuildFailure { round: Round, exit_code: i32 },

    #[error("{operation} timed out after {millis}ms")]
    TimedOut { operation: String, millis: u64 },

    #[error("Unknown variation: {0}")]
    UnknownVariation(String),

    #[error("Variations `{first}` and `{second}` both control {dimension}")]
    VariationConflict {
        dimension: String,
        first: String,
        second: String,
    },

    #[error("Variation `{name}` needs testbed capability `{capability}`")]
    UnsupportedVariation { name: String, capability: String },

    #[error("Pattern `{pattern}` matched no artifacts in round {round}")]
    ArtifactNotFound { round: Round, pattern: String },

    #[error("Diff engine error: {0}")]
    DiffEngine(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, serializable classification of an [`Error`], handed to the
/// reporting layer together with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Io,
    BackendProtocol,
    BackendFailure,
    BuildFailure,
    TimedOut,
    UnknownVariation,
    VariationConflict,
    UnsupportedVariation,
    ArtifactNotFound,
    DiffEngine,
    InvalidConfig,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Internal,
            Error::BackendProtocol(_) => ErrorKind::BackendProtocol,
            Error::BackendFailure { .. } => ErrorKind::BackendFailure,
            Error::BuildFailure { .. } => ErrorKind::BuildFailure,
            Error::TimedOut { .. } => ErrorKind::TimedOut,
            Error::UnknownVariation(_) => ErrorKind::UnknownVariation,
            Error::VariationConflict { .. } => ErrorKind::VariationConflict,
            Error::UnsupportedVariation { .. } => ErrorKind::UnsupportedVariation,
            Error::ArtifactNotFound { .. } => ErrorKind::ArtifactNotFound,
            Error::DiffEngine(_) => ErrorKind::DiffEngine,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::InvalidStateTransition { .. } => ErrorKind::Internal,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error leaves the testbed session unusable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::BackendProtocol(_) | Error::TimedOut { .. } | Error::Cancelled
        )
    }

    /// Structured form of the error for the reporting layer.
    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// A structured error as handed to the CLI/reporting layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}
