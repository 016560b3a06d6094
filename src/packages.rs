//! Package installation through pacman and pacstrap
//!
//! The package path uses every engine component:
//!
//! - `run()` waits on the pacman database lock, then retries the command when
//!   the failure looks like a mirror sync problem, resyncing in between
//!   (the resync waits on the lock too)
//! - `strap()` runs the global hooks over the package list, then installs it
//!   in batches, each batch retried with a forced resync as corrective action
//! - After the engine gives up, `ask()` lets the operator retry, except after
//!   a lock timeout, which ends the run
//!
//! Every package step is hard: a failed install aborts the pipeline.

use crate::command::{argv, CommandError, CommandOutput, CommandRunner};
use crate::config::InstallConfig;
use crate::engine::hooks;
use crate::engine::{
    BatchExecutor, Clock, LockCoordinator, LockWaitSpec, Pipeline, RetryEngine, RetryPolicy,
    Step,
};
use crate::error::ProvisionError;
use crate::prompt::Confirm;
use anyhow::{Context, Result};
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const RETRY_QUESTION: &str = "Would you like to re-try this download?";

/// True when `err` matches one of `markers`, case-insensitively.
pub fn is_sync_failure(err: &CommandError, markers: &[String]) -> bool {
    let text = err.text().to_lowercase();
    markers.iter().any(|m| text.contains(&m.to_lowercase()))
}

/// Corrective action: force a package database refresh once the lock is free.
fn resync(
    runner: Arc<dyn CommandRunner>,
    lock: LockCoordinator,
    spec: LockWaitSpec,
) -> impl Fn() -> Result<()> + Send + Sync {
    move || {
        lock.await_free(&spec)?;
        runner
            .run(&argv(["pacman", "-Syy"]))
            .map(drop)
            .context("Failed to refresh package database")
    }
}

pub struct Pacman<'a> {
    target: PathBuf,
    runner: Arc<dyn CommandRunner>,
    confirm: &'a dyn Confirm,
    config: &'a InstallConfig,
    lock: LockCoordinator,
    retry: RetryEngine,
    silent: bool,
    synced: Cell<bool>,
}

impl<'a> Pacman<'a> {
    pub fn new(
        target: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        confirm: &'a dyn Confirm,
        config: &'a InstallConfig,
        lock: LockCoordinator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            target: target.into(),
            runner,
            confirm,
            config,
            lock,
            retry: RetryEngine::new(clock),
            silent: false,
            synced: Cell::new(false),
        }
    }

    /// Never prompt; a fatal failure is final.
    #[must_use]
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn is_synced(&self) -> bool {
        self.synced.get()
    }

    /// Run `pacman <args>` once the database lock is free.
    ///
    /// Sync failures are retried with `pacman -Syy` in between.
    pub fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let policy = self.command_policy()?.with_corrective(resync(
            Arc::clone(&self.runner),
            self.lock.clone(),
            self.config.lock.wait_spec(),
        ));
        self.run_with(args, &policy)
    }

    fn run_with(&self, args: &[&str], policy: &RetryPolicy<CommandError>) -> Result<CommandOutput> {
        self.lock.await_free(&self.config.lock.wait_spec())?;

        let mut command = vec!["pacman".to_string()];
        command.extend(args.iter().map(|a| a.to_string()));

        self.retry
            .execute(|| self.runner.run(&command), policy)
            .map_err(|failure| {
                anyhow::Error::new(failure.into_provision_error())
                    .context(format!("pacman {}", args.join(" ")))
            })
    }

    /// Retry policy for single pacman commands, without a corrective action.
    fn command_policy(&self) -> Result<RetryPolicy<CommandError>, ProvisionError> {
        let markers = self.config.packages.transient_markers.clone();
        Ok(self
            .config
            .packages
            .command_retry
            .policy()?
            .with_classifier(move |e: &CommandError| is_sync_failure(e, &markers)))
    }

    /// Retry policy for one pacstrap batch.
    ///
    /// Any non-zero exit is worth another try after a resync; a tool that
    /// cannot be started is not.
    fn batch_policy(&self) -> Result<RetryPolicy<CommandError>, ProvisionError> {
        Ok(self
            .config
            .packages
            .batch_retry
            .policy()?
            .with_classifier(CommandError::is_exit_failure)
            .with_corrective(resync(
                Arc::clone(&self.runner),
                self.lock.clone(),
                self.config.lock.wait_spec(),
            )))
    }

    /// Run `op` until it succeeds or the operator stops retrying.
    ///
    /// # Errors
    ///
    /// `Requirement("<bail_message>: <error>")` once the operator declines
    /// (or immediately when silent). A `LockTimeout` is returned as is,
    /// without asking.
    pub fn ask<T>(
        &self,
        error_message: &str,
        bail_message: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    error!("{}: {:#}", error_message, err);
                    if matches!(
                        err.downcast_ref::<ProvisionError>(),
                        Some(ProvisionError::LockTimeout { .. })
                    ) {
                        return Err(err);
                    }
                    if !self.silent && self.confirm.confirm(RETRY_QUESTION) {
                        continue;
                    }
                    return Err(ProvisionError::requirement(format!("{bail_message}: {err:#}")).into());
                }
            }
        }
    }

    /// Refresh the package database, once per instance.
    ///
    /// A retry of `-Syy` is already a resync, so no corrective runs in between.
    pub fn sync(&self) -> Result<()> {
        if self.synced.get() {
            return Ok(());
        }
        let policy = self.command_policy()?;
        self.ask(
            "Could not sync a new package database",
            "Could not sync mirrors",
            || self.run_with(&["-Syy"], &policy),
        )?;
        self.synced.set(true);
        Ok(())
    }

    fn pacstrap_argv(&self, batch: &[String]) -> Vec<String> {
        let mut cmd = vec![
            "pacstrap".to_string(),
            "-C".to_string(),
            self.config.packages.pacman_conf.display().to_string(),
            "-K".to_string(),
            self.target.display().to_string(),
        ];
        cmd.extend(batch.iter().cloned());
        cmd.push("--noconfirm".to_string());
        cmd
    }

    /// Install `packages` into the target in batches.
    pub fn strap(&self, packages: &[String]) -> Result<()> {
        self.sync()?;

        let packages = hooks::apply(packages.to_vec()).context("Package hooks failed")?;
        let batch_size = self.config.packages.batch_config()?;
        info!(
            "Installing {} package(s) in batches of {}: {}",
            packages.len(),
            batch_size.batch_size(),
            packages.join(" ")
        );

        let policy = self.batch_policy()?;
        let executor = BatchExecutor::new(self.retry.clone());
        let mut resume_at = 0;
        self.ask("Could not install packages", "Package installation failed", || {
            executor
                .run_from(
                    resume_at,
                    &packages,
                    batch_size,
                    |batch| {
                        info!("Installing package batch: {}", batch.join(" "));
                        self.runner.run(&self.pacstrap_argv(batch)).map(drop)
                    },
                    &policy,
                )
                .map_err(|failure| {
                    resume_at = failure.batch_index;
                    if failure.failure.exhausted {
                        warn!(
                            "Batch {} failed after {} attempt(s), retries exhausted; later batches were not started",
                            failure.batch_index, failure.failure.attempts
                        );
                    } else {
                        warn!(
                            "Batch {} failed fatally; later batches were not started",
                            failure.batch_index
                        );
                    }
                    anyhow::Error::new(failure.failure.into_provision_error())
                        .context(format!("package batch {}", failure.batch_index))
                })
        })
    }

    /// Pipeline installing `packages`: sync, then strap. Both steps are hard.
    pub fn pipeline<'p>(&'p self, packages: &'p [String]) -> Pipeline<'p> {
        Pipeline::new("packages")
            .step(Step::hard("sync-package-database", move || self.sync()))
            .step(Step::hard("install-packages", move || self.strap(packages)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::engine::{ManualClock, PipelineStatus};
    use crate::prompt::NonInteractive;
    use std::path::Path;
    use std::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SYNC_ERROR: &str = "error: failed to synchronize all databases";

    /// Says yes the first `n` times.
    struct Answers(AtomicUsize);

    impl Confirm for Answers {
        fn confirm(&self, _question: &str) -> bool {
            self.0
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    fn pkgs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pacman<'a>(
        runner: Arc<ScriptedRunner>,
        confirm: &'a dyn Confirm,
        config: &'a InstallConfig,
    ) -> (Pacman<'a>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let lock = LockCoordinator::new(clock.clone(), Arc::new(|_: &Path| false));
        (
            Pacman::new("/mnt", runner, confirm, config, lock, clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_sync_failure_classifier() {
        let markers = InstallConfig::default().packages.transient_markers;
        let err = CommandError::Failed {
            command: "pacman -S".into(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "error: Failed retrieving file 'core.db'".into(),
        };
        assert!(is_sync_failure(&err, &markers));

        let err = CommandError::Failed {
            command: "pacman -S".into(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "error: target not found: foo".into(),
        };
        assert!(!is_sync_failure(&err, &markers));
    }

    #[test]
    fn test_run_resyncs_between_sync_failures() {
        let runner = Arc::new(ScriptedRunner::new().fail("pacman -S vim", 2, SYNC_ERROR));
        let config = InstallConfig::default();
        let (pacman, clock) = pacman(runner.clone(), &NonInteractive, &config);

        pacman.run(&["-S", "vim"]).expect("third attempt succeeds");
        assert_eq!(
            runner.calls(),
            vec![
                "pacman -S vim",
                "pacman -Syy",
                "pacman -S vim",
                "pacman -Syy",
                "pacman -S vim"
            ]
        );
        assert_eq!(
            clock.sleeps(),
            vec![
                std::time::Duration::from_secs(2),
                std::time::Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_run_does_not_retry_other_failures() {
        let runner = Arc::new(ScriptedRunner::new().fail("pacman -S foo", 1, "target not found"));
        let config = InstallConfig::default();
        let (pacman, _clock) = pacman(runner.clone(), &NonInteractive, &config);

        assert!(pacman.run(&["-S", "foo"]).is_err());
        assert_eq!(runner.calls(), vec!["pacman -S foo"]);
    }

    #[test]
    fn test_run_times_out_on_held_lock() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut config = InstallConfig::default();
        config.lock.timeout_secs = 1;
        let clock = Arc::new(ManualClock::new());
        let lock = LockCoordinator::new(clock.clone(), Arc::new(|_: &Path| true));
        let pacman = Pacman::new("/mnt", runner.clone(), &NonInteractive, &config, lock, clock);

        let err = pacman.run(&["-Syy"]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::LockTimeout { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_sync_lock_timeout_is_not_offered_for_retry() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut config = InstallConfig::default();
        config.lock.timeout_secs = 1;
        let answers = Answers(AtomicUsize::new(5));
        let clock = Arc::new(ManualClock::new());
        let lock = LockCoordinator::new(clock.clone(), Arc::new(|_: &Path| true));
        let pacman = Pacman::new("/mnt", runner.clone(), &answers, &config, lock, clock.clone());

        let err = pacman.sync().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::LockTimeout { .. })
        ));
        // Nobody was asked, and the lock was waited on once
        assert_eq!(answers.0.load(Ordering::SeqCst), 5);
        assert!(clock.now() <= Duration::from_millis(1250));
        assert!(runner.calls().is_empty());
        assert!(!pacman.is_synced());
    }

    #[test]
    fn test_sync_retry_is_its_own_resync() {
        let runner = Arc::new(ScriptedRunner::new().fail("pacman -Syy", 2, SYNC_ERROR));
        let config = InstallConfig::default();
        let (pacman, clock) = pacman(runner.clone(), &NonInteractive, &config);

        pacman.sync().unwrap();
        assert_eq!(runner.calls(), vec!["pacman -Syy", "pacman -Syy", "pacman -Syy"]);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[test]
    fn test_resync_waits_for_the_lock() {
        let runner = Arc::new(ScriptedRunner::new().fail("pacman -S vim", 1, SYNC_ERROR));
        let config = InstallConfig::default();
        let clock = Arc::new(ManualClock::new());
        // Free for the command itself, held for two checks during the resync
        let checks = AtomicUsize::new(0);
        let probe = move |_: &Path| matches!(checks.fetch_add(1, Ordering::SeqCst), 1 | 2);
        let lock = LockCoordinator::new(clock.clone(), Arc::new(probe));
        let pacman = Pacman::new("/mnt", runner.clone(), &NonInteractive, &config, lock, clock.clone());

        pacman.run(&["-S", "vim"]).unwrap();
        assert_eq!(runner.calls(), vec!["pacman -S vim", "pacman -Syy", "pacman -S vim"]);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(250), Duration::from_secs(2)]
        );
    }

    #[test]
    fn test_sync_runs_once() {
        let runner = Arc::new(ScriptedRunner::new());
        let config = InstallConfig::default();
        let (pacman, _clock) = pacman(runner.clone(), &NonInteractive, &config);

        pacman.sync().unwrap();
        pacman.sync().unwrap();
        assert!(pacman.is_synced());
        assert_eq!(runner.count("pacman -Syy"), 1);
    }

    #[test]
    fn test_ask_retries_while_operator_agrees() {
        let runner = Arc::new(ScriptedRunner::new());
        let config = InstallConfig::default();
        let answers = Answers(AtomicUsize::new(1));
        let (pacman, _clock) = pacman(runner, &answers, &config);

        let mut calls = 0;
        let err = pacman
            .ask("Could not install", "Installation failed", || {
                calls += 1;
                anyhow::bail!("mirror down")
            })
            .map(|()| ())
            .unwrap_err();

        assert_eq!(calls, 2);
        assert_eq!(err.to_string(), "Installation failed: mirror down");
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Requirement(_))
        ));
    }

    #[test]
    fn test_strap_installs_in_batches() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut config = InstallConfig::default();
        config.packages.batch_size = 2;
        let (pacman, _clock) = pacman(runner.clone(), &NonInteractive, &config);

        pacman.strap(&pkgs(&["base", "linux", "vim"])).unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "pacman -Syy",
                "pacstrap -C /etc/pacman.conf -K /mnt base linux --noconfirm",
                "pacstrap -C /etc/pacman.conf -K /mnt vim --noconfirm"
            ]
        );
    }

    #[test]
    fn test_strap_resumes_at_failed_batch_after_confirmation() {
        // Batch 1 fails all three attempts once, then succeeds after the operator retries.
        let runner = Arc::new(ScriptedRunner::new().fail("/mnt c d", 3, "exit 1"));
        let mut config = InstallConfig::default();
        config.packages.batch_size = 2;
        let answers = Answers(AtomicUsize::new(1));
        let (pacman, _clock) = pacman(runner.clone(), &answers, &config);

        pacman.strap(&pkgs(&["a", "b", "c", "d", "e"])).unwrap();
        assert_eq!(runner.count("/mnt a b"), 1);
        assert_eq!(runner.count("/mnt c d"), 4);
        assert_eq!(runner.count("/mnt e"), 1);
        // Initial sync plus one resync before each of the two automatic retries.
        assert_eq!(runner.count("pacman -Syy"), 3);
    }

    #[test]
    fn test_package_pipeline_aborts_on_failed_batch() {
        let runner = Arc::new(ScriptedRunner::new().fail("pacstrap", 3, "exit 1"));
        let config = InstallConfig::default();
        let (pacman, _clock) = pacman(runner.clone(), &NonInteractive, &config);
        let packages = pkgs(&["base"]);

        let outcome = pacman.pipeline(&packages).run().unwrap();
        assert_eq!(outcome.status(), PipelineStatus::Aborted);
        assert_eq!(outcome.failed_step(), Some("install-packages"));
        assert!(outcome.error().unwrap().contains("Package installation failed"));
    }
}
