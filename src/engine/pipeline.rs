//! Staged Pipeline
//!
//! Runs a named, ordered sequence of provisioning steps and reports a
//! structured outcome. Each step carries a fixed [`FailureMode`]:
//!
//! - **Hard**: a failure aborts the run; later steps never start.
//! - **BestEffort**: a failure is recorded and the run moves on.
//!
//! # State Flow
//!
//! ```text
//! Pending
//!     ↓
//! Running(0) → Running(1) → ... → Running(n-1)
//!     ↓                                 ↓
//! Aborted (hard step failed)     Succeeded | SucceededWithWarnings
//! ```
//!
//! Steps run strictly in declaration order, one at a time. The pipeline never
//! re-runs a best-effort step; any retrying belongs to the step's own
//! operation.

use crate::error::ProvisionError;
use std::fmt;
use strum::{Display, EnumString, IntoStaticStr};
use tracing::{error, info, info_span, warn};

/// How a step failure affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum FailureMode {
    /// Failure invalidates everything downstream
    Hard,
    /// Failure is tolerated and recorded as a warning
    BestEffort,
}

/// Terminal status of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    SucceededWithWarnings,
    Aborted,
}

/// Where a pipeline is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    /// Executing the step at this index
    Running(usize),
    Finished(PipelineStatus),
}

type StepFn<'a> = Box<dyn FnMut() -> anyhow::Result<()> + 'a>;

/// One named unit of provisioning work.
pub struct Step<'a> {
    name: String,
    failure_mode: FailureMode,
    operation: StepFn<'a>,
}

impl<'a> Step<'a> {
    pub fn new(
        name: impl Into<String>,
        failure_mode: FailureMode,
        operation: impl FnMut() -> anyhow::Result<()> + 'a,
    ) -> Self {
        Self {
            name: name.into(),
            failure_mode,
            operation: Box::new(operation),
        }
    }

    /// A step whose failure aborts the pipeline.
    pub fn hard(name: impl Into<String>, operation: impl FnMut() -> anyhow::Result<()> + 'a) -> Self {
        Self::new(name, FailureMode::Hard, operation)
    }

    /// A step whose failure is only recorded.
    pub fn best_effort(
        name: impl Into<String>,
        operation: impl FnMut() -> anyhow::Result<()> + 'a,
    ) -> Self {
        Self::new(name, FailureMode::BestEffort, operation)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }
}

impl fmt::Debug for Step<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}

/// Result of one pipeline run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    status: PipelineStatus,
    failed_step: Option<String>,
    error: Option<String>,
    best_effort_failures: Vec<String>,
    warnings: Vec<String>,
}

impl PipelineOutcome {
    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    /// Name of the hard step that aborted the run
    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    /// Rendered error of the aborting step
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Names of failed best-effort steps, in run order
    pub fn best_effort_failures(&self) -> &[String] {
        &self.best_effort_failures
    }

    /// Rendered error of each failed best-effort step, parallel to `best_effort_failures`
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_success(&self) -> bool {
        self.status != PipelineStatus::Aborted
    }

    /// `Err(StepAborted)` for an aborted run, `Ok` otherwise.
    pub fn into_result(self) -> Result<Self, ProvisionError> {
        match self.status {
            PipelineStatus::Aborted => Err(ProvisionError::StepAborted {
                step: self.failed_step.unwrap_or_default(),
                message: self.error.unwrap_or_default(),
            }),
            _ => Ok(self),
        }
    }
}

/// An ordered sequence of steps, fixed at construction.
pub struct Pipeline<'a> {
    name: String,
    steps: Vec<Step<'a>>,
    state: PipelineState,
}

impl<'a> Pipeline<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            state: PipelineState::Pending,
        }
    }

    /// Append a step. Builder style; only valid before the run.
    #[must_use]
    pub fn step(mut self, step: Step<'a>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(name: impl Into<String>, steps: Vec<Step<'a>>) -> Self {
        Self {
            name: name.into(),
            steps,
            state: PipelineState::Pending,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order and report the outcome.
    ///
    /// # Errors
    ///
    /// `Config` if this pipeline already ran. Step failures are never
    /// returned as errors; they are part of the outcome.
    pub fn run(&mut self) -> Result<PipelineOutcome, ProvisionError> {
        if self.state != PipelineState::Pending {
            return Err(ProvisionError::config(format!(
                "pipeline '{}' has already run",
                self.name
            )));
        }

        let span = info_span!("pipeline", name = %self.name);
        let _enter = span.enter();

        let total = self.steps.len();
        let mut best_effort_failures = Vec::new();
        let mut warnings = Vec::new();

        for (index, step) in self.steps.iter_mut().enumerate() {
            self.state = PipelineState::Running(index);
            info!("[{}/{}] {}", index + 1, total, step.name);

            let Err(err) = (step.operation)() else {
                continue;
            };

            match step.failure_mode {
                FailureMode::Hard => {
                    error!("Step '{}' failed: {:#}", step.name, err);
                    self.state = PipelineState::Finished(PipelineStatus::Aborted);
                    return Ok(PipelineOutcome {
                        status: PipelineStatus::Aborted,
                        failed_step: Some(step.name.clone()),
                        error: Some(format!("{err:#}")),
                        best_effort_failures,
                        warnings,
                    });
                }
                FailureMode::BestEffort => {
                    warn!("Optional step '{}' failed, continuing: {:#}", step.name, err);
                    best_effort_failures.push(step.name.clone());
                    warnings.push(format!("{err:#}"));
                }
            }
        }

        let status = if best_effort_failures.is_empty() {
            PipelineStatus::Succeeded
        } else {
            PipelineStatus::SucceededWithWarnings
        };
        self.state = PipelineState::Finished(status);
        info!("Pipeline {} finished: {}", self.name, status);

        Ok(PipelineOutcome {
            status,
            failed_step: None,
            error: None,
            best_effort_failures,
            warnings,
        })
    }
}
