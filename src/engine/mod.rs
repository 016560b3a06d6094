//! Engine modules: resilient orchestration of external operations that may fail.
//!
//! The engine knows nothing about pacman or ZFS. Callers hand it operations
//! plus a classifier for transient errors and optional corrective actions.
//!
//! Leaves first: `clock` → `lock` → `retry` → `batch` → `pipeline`, with
//! `hooks` consulted once before a batch run.

pub mod batch;
pub mod clock;
pub mod hooks;
pub mod lock;
pub mod pipeline;
pub mod retry;

pub use batch::{chunk_bounds, BatchConfig, BatchExecutor, BatchFailure};
pub use clock::{Clock, ManualClock, SystemClock};
pub use hooks::{Hook, HookRegistry};
pub use lock::{FsProbe, LockCoordinator, LockWaitSpec, ResourceProbe};
pub use pipeline::{FailureMode, Pipeline, PipelineOutcome, PipelineState, PipelineStatus, Step};
pub use retry::{FatalFailure, RetryEngine, RetryPolicy};
