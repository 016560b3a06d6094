//! Provisor Library
//!
//! Resilient orchestration for a guided Arch Linux installer: waiting on the
//! package database lock, retrying flaky operations with backoff, installing
//! packages in batches, and running staged pipelines with hard and
//! best-effort steps.

pub mod cli;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod packages;
pub mod patch;
pub mod process_guard;
pub mod prompt;
pub mod zfs;

// Re-export main types for convenience
pub use command::{CommandError, CommandOutput, CommandRunner, SystemRunner};
pub use config::{InstallConfig, LockSettings, PackageSettings, RetrySettings, ZfsSettings};
pub use engine::{
    BatchConfig, BatchExecutor, Clock, FailureMode, LockCoordinator, LockWaitSpec, ManualClock,
    Pipeline, PipelineOutcome, PipelineStatus, RetryEngine, RetryPolicy, Step, SystemClock,
};
pub use error::ProvisionError;
pub use packages::Pacman;
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use prompt::{Confirm, NonInteractive, TerminalConfirm};
pub use zfs::ZfsManager;
