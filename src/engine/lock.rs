//! Lock Coordinator
//!
//! Waits for an exclusive external resource (the pacman database lock, for
//! instance) to disappear before an operation is allowed to start.
//!
//! This only observes absence. Nothing is acquired, so another process can
//! take the resource right after [`LockCoordinator::await_free`] returns. It
//! is a best-effort gate, not a mutex.

use crate::engine::clock::Clock;
use crate::error::ProvisionError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// One wait condition. Stateless; re-evaluated on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockWaitSpec {
    pub resource_path: PathBuf,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl LockWaitSpec {
    pub fn new(
        resource_path: impl Into<PathBuf>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            resource_path: resource_path.into(),
            poll_interval,
            timeout,
        }
    }
}

/// Answers whether a named resource currently exists.
pub trait ResourceProbe: Send + Sync {
    fn is_present(&self, path: &Path) -> bool;
}

/// Probe backed by the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl ResourceProbe for FsProbe {
    fn is_present(&self, path: &Path) -> bool {
        path.exists()
    }
}

impl<F> ResourceProbe for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn is_present(&self, path: &Path) -> bool {
        self(path)
    }
}

#[derive(Clone)]
pub struct LockCoordinator {
    clock: Arc<dyn Clock>,
    probe: Arc<dyn ResourceProbe>,
}

impl LockCoordinator {
    pub fn new(clock: Arc<dyn Clock>, probe: Arc<dyn ResourceProbe>) -> Self {
        Self { clock, probe }
    }

    /// Coordinator that checks the real filesystem.
    pub fn with_fs(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, Arc::new(FsProbe))
    }

    /// Block until `spec.resource_path` is absent.
    ///
    /// # Errors
    ///
    /// `LockTimeout` with the elapsed time once more than `spec.timeout` has
    /// passed and a final check still finds the resource.
    pub fn await_free(&self, spec: &LockWaitSpec) -> Result<(), ProvisionError> {
        let path = spec.resource_path.as_path();
        if !self.probe.is_present(path) {
            return Ok(());
        }

        warn!(
            "{} is held by another process, waiting up to {}s for it to be released",
            path.display(),
            spec.timeout.as_secs()
        );

        let started = self.clock.now();
        let mut polls = 0u32;
        while self.probe.is_present(path) {
            self.clock.sleep(spec.poll_interval);
            polls += 1;

            let elapsed = self.clock.now().saturating_sub(started);
            if elapsed > spec.timeout {
                if !self.probe.is_present(path) {
                    break;
                }
                error!(
                    "{} was never released ({} polls); clean up the other session and retry",
                    path.display(),
                    polls
                );
                return Err(ProvisionError::LockTimeout {
                    path: spec.resource_path.clone(),
                    elapsed,
                });
            }
        }

        debug!("{} released after {} polls", path.display(), polls);
        Ok(())
    }
}
