//! Error handling module for provisor
//!
//! Provides the crate-level error taxonomy using thiserror. The engine's
//! generic failures (`FatalFailure`, `BatchFailure`) live next to the code
//! that produces them; this type is what crosses the pipeline boundary.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for provisor
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// An exclusive resource was still held when the wait budget ran out
    #[error("Lock {} was not released after {:.1}s", path.display(), elapsed.as_secs_f64())]
    LockTimeout { path: PathBuf, elapsed: Duration },

    /// A non-transient failure, or a transient one that exhausted its retries
    #[error("Operation failed after {attempts} attempt(s): {message}")]
    FatalOperation { message: String, attempts: u32 },

    /// A hard pipeline step failed and the run was aborted
    #[error("Step '{step}' failed: {message}")]
    StepAborted { step: String, message: String },

    /// The operator declined to retry after a fatal failure
    #[error("{0}")]
    Requirement(String),

    /// Settings file errors (loading, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Retry policy or batch configuration outside its allowed range
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
}

impl ProvisionError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a requirement error
    pub fn requirement(msg: impl Into<String>) -> Self {
        Self::Requirement(msg.into())
    }

    /// Create an invalid policy error
    pub fn invalid_policy(msg: impl Into<String>) -> Self {
        Self::InvalidPolicy(msg.into())
    }

    /// Process exit code to report for this error.
    ///
    /// Every failure that reaches the top level is fatal for the run.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
