//! Retry Policy Engine
//!
//! Wraps a single fallible operation with bounded retries, exponential
//! backoff, and an optional corrective action that runs before each retry.
//!
//! # Algorithm
//!
//! ```text
//! attempt 1 ──► ok ──────────────────────────────► Ok(value)
//!     │
//!     └─ err ─► is_transient? ── no ──────────────► FatalFailure (attempts = 1)
//!                   │
//!                  yes ─► attempts left? ── no ───► FatalFailure (exhausted)
//!                              │
//!                             yes ─► on_transient (errors logged only)
//!                                    sleep base_delay * multiplier^(attempt-1)
//!                                    attempt + 1
//! ```
//!
//! The classifier and the corrective action are supplied by the caller, so
//! the engine never looks inside tool output itself.

use crate::engine::clock::Clock;
use crate::error::ProvisionError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

type Classifier<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type Corrective = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Immutable retry configuration, shared read-only by every call that uses it.
pub struct RetryPolicy<E> {
    max_attempts: u32,
    base_delay: Duration,
    backoff_multiplier: f64,
    is_transient: Classifier<E>,
    on_transient: Option<Corrective>,
}

impl<E> RetryPolicy<E> {
    /// Create a policy that treats every error as transient.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` if `max_attempts` is zero or `backoff_multiplier` is
    /// below 1 or not finite.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, ProvisionError> {
        if max_attempts == 0 {
            return Err(ProvisionError::invalid_policy(
                "max_attempts must be at least 1",
            ));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(ProvisionError::invalid_policy(format!(
                "backoff_multiplier must be a finite number >= 1, got {backoff_multiplier}"
            )));
        }

        Ok(Self {
            max_attempts,
            base_delay,
            backoff_multiplier,
            is_transient: Box::new(|_| true),
            on_transient: None,
        })
    }

    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            is_transient: Box::new(|_| false),
            on_transient: None,
        }
    }

    /// Replace the transient-error classifier.
    #[must_use]
    pub fn with_classifier(mut self, is_transient: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.is_transient = Box::new(is_transient);
        self
    }

    /// Set the corrective action that runs before each retry of a transient failure.
    #[must_use]
    pub fn with_corrective(
        mut self,
        on_transient: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_transient = Some(Box::new(on_transient));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn is_transient(&self, error: &E) -> bool {
        (self.is_transient)(error)
    }

    /// Delay slept after failed attempt `attempt` (1-based), before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("corrective", &self.on_transient.is_some())
            .finish()
    }
}

/// The operation failed for good.
#[derive(Error, Debug)]
#[error("failed after {attempts} attempt(s): {error}")]
pub struct FatalFailure<E> {
    /// Error returned by the last attempt
    pub error: E,
    /// Physical invocations made, in `[1, max_attempts]`
    pub attempts: u32,
    /// True when the last error was transient and retries ran out
    pub exhausted: bool,
}

impl<E: fmt::Display> FatalFailure<E> {
    /// Flatten into the crate error, keeping the rendered message.
    pub fn into_provision_error(self) -> ProvisionError {
        let message = if self.exhausted {
            format!("{} (retries exhausted)", self.error)
        } else {
            self.error.to_string()
        };
        ProvisionError::FatalOperation {
            message,
            attempts: self.attempts,
        }
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryEngine {
    clock: Arc<dyn Clock>,
}

impl RetryEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    pub fn execute<T, E, F>(
        &self,
        mut operation: F,
        policy: &RetryPolicy<E>,
    ) -> Result<T, FatalFailure<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let error = match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded on attempt {}/{}", attempt, policy.max_attempts);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !policy.is_transient(&error) {
                debug!("Non-transient failure on attempt {}: {}", attempt, error);
                return Err(FatalFailure {
                    error,
                    attempts: attempt,
                    exhausted: false,
                });
            }

            if attempt >= policy.max_attempts {
                if policy.max_attempts > 1 {
                    warn!("Giving up after {} attempts: {}", attempt, error);
                }
                return Err(FatalFailure {
                    error,
                    attempts: attempt,
                    exhausted: true,
                });
            }

            let delay = policy.delay_after(attempt);
            warn!(
                "Operation failed (attempt {}/{}): {}",
                attempt, policy.max_attempts, error
            );

            if let Some(corrective) = &policy.on_transient {
                if let Err(e) = corrective() {
                    warn!("Corrective action failed: {:#}", e);
                }
            }

            warn!("Retrying in {:.1} seconds...", delay.as_secs_f64());
            self.clock.sleep(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> (RetryEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (RetryEngine::new(clock.clone()), clock)
    }

    #[test]
    fn test_success_on_first_attempt_does_not_sleep() {
        let (engine, clock) = engine();
        let policy = RetryPolicy::<String>::new(3, Duration::from_secs(2), 2.0).unwrap();

        let value = engine.execute(|| Ok::<_, String>(42), &policy).unwrap();
        assert_eq!(value, 42);
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn test_transient_failure_is_retried_with_backoff() {
        let (engine, clock) = engine();
        let policy = RetryPolicy::<String>::new(4, Duration::from_secs(2), 2.0).unwrap();
        let calls = Cell::new(0);

        let failure = engine
            .execute(
                || {
                    calls.set(calls.get() + 1);
                    Err::<(), _>("failed to synchronize all databases".to_string())
                },
                &policy,
            )
            .unwrap_err();

        assert_eq!(calls.get(), 4);
        assert_eq!(failure.attempts, 4);
        assert!(failure.exhausted);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[test]
    fn test_non_transient_failure_is_not_retried() {
        let (engine, clock) = engine();
        let policy = RetryPolicy::<String>::new(5, Duration::from_secs(1), 2.0)
            .unwrap()
            .with_classifier(|e: &String| e.contains("timeout"));
        let calls = Cell::new(0);

        let failure = engine
            .execute(
                || {
                    calls.set(calls.get() + 1);
                    Err::<(), _>("target not found".to_string())
                },
                &policy,
            )
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert_eq!(failure.attempts, 1);
        assert!(!failure.exhausted);
        assert_eq!(clock.sleep_count(), 0);
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let (engine, _clock) = engine();
        let policy = RetryPolicy::<String>::new(3, Duration::from_millis(10), 1.0).unwrap();
        let calls = Cell::new(0);

        let value = engine
            .execute(
                || {
                    calls.set(calls.get() + 1);
                    if calls.get() < 3 {
                        Err("busy".to_string())
                    } else {
                        Ok("done")
                    }
                },
                &policy,
            )
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_corrective_action_runs_before_each_retry() {
        let (engine, _clock) = engine();
        let resyncs = Arc::new(AtomicU32::new(0));
        let counter = resyncs.clone();
        let policy = RetryPolicy::<String>::new(3, Duration::from_secs(1), 2.0)
            .unwrap()
            .with_corrective(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let _ = engine.execute(|| Err::<(), _>("flaky".to_string()), &policy);
        // Two retries follow the first failure; no corrective after the last.
        assert_eq!(resyncs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_corrective_failure_is_not_propagated() {
        let (engine, _clock) = engine();
        let policy = RetryPolicy::<String>::new(2, Duration::ZERO, 1.0)
            .unwrap()
            .with_corrective(|| anyhow::bail!("mirror unreachable"));
        let calls = Cell::new(0);

        let value = engine
            .execute(
                || {
                    calls.set(calls.get() + 1);
                    if calls.get() == 1 { Err("flaky".to_string()) } else { Ok(7) }
                },
                &policy,
            )
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_single_attempt_policy_has_no_backoff_or_corrective() {
        let (engine, clock) = engine();
        let corrected = Arc::new(AtomicU32::new(0));
        let counter = corrected.clone();
        let policy = RetryPolicy::<String>::new(1, Duration::from_secs(5), 2.0)
            .unwrap()
            .with_corrective(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let failure = engine
            .execute(|| Err::<(), _>("boom".to_string()), &policy)
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(clock.sleep_count(), 0);
        assert_eq!(corrected.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_policy_rejects_invalid_parameters() {
        assert!(RetryPolicy::<String>::new(0, Duration::ZERO, 2.0).is_err());
        assert!(RetryPolicy::<String>::new(3, Duration::ZERO, 0.5).is_err());
        assert!(RetryPolicy::<String>::new(3, Duration::ZERO, f64::NAN).is_err());
        assert!(RetryPolicy::<String>::new(1, Duration::ZERO, 1.0).is_ok());
    }

    #[test]
    fn test_delay_after_is_exponential() {
        let policy = RetryPolicy::<String>::new(5, Duration::from_secs(5), 2.0).unwrap();
        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after(3), Duration::from_secs(20));
    }

    #[test]
    fn test_fatal_failure_display() {
        let failure = FatalFailure {
            error: "exit status 1".to_string(),
            attempts: 3,
            exhausted: true,
        };
        assert_eq!(failure.to_string(), "failed after 3 attempt(s): exit status 1");
        let err = failure.into_provision_error();
        assert!(matches!(err, ProvisionError::FatalOperation { attempts: 3, .. }));
        assert_eq!(
            err.to_string(),
            "Operation failed after 3 attempt(s): exit status 1 (retries exhausted)"
        );
    }

    #[test]
    fn test_fatal_on_first_sight_is_not_marked_exhausted() {
        let failure = FatalFailure {
            error: "permission denied".to_string(),
            attempts: 1,
            exhausted: false,
        };
        assert_eq!(
            failure.into_provision_error().to_string(),
            "Operation failed after 1 attempt(s): permission denied"
        );
    }
}
