//! reprotest testbed backends
//!
//! The null backend serves the control protocol on stdin/stdout and runs
//! every command on the local host inside a scratch directory.

pub mod fs;
pub mod server;

pub use server::{serve, NullBackend};
