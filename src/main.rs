//! Provisor - Main entry point

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use provisor::cli::{Cli, Commands};
use provisor::engine::PipelineOutcome;
use provisor::{
    Clock, CommandRunner, Confirm, InstallConfig, LockCoordinator, NonInteractive, Pacman,
    ProvisionError, RetryEngine, SystemClock, SystemRunner, TerminalConfirm, ZfsManager,
    process_guard,
};

/// Initialize logging; `RUST_LOG` overrides the default `info` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    init_tracing();
    info!("Provisor starting up");

    // Children are killed with their process group if we are interrupted
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    if let Err(err) = run(cli) {
        error!("{:#}", err);
        eprintln!("✗ {:#}", err);
        let code = err
            .downcast_ref::<ProvisionError>()
            .map_or(1, ProvisionError::exit_code);
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Commands::Validate { path } => return validate(&path),
        command => command,
    };

    let config = InstallConfig::load_or_default(cli.config.as_deref())?;
    config.validate()?;

    let runner: Arc<dyn CommandRunner> = if cli.dry_run {
        info!("Dry-run mode: commands are logged, not executed");
        Arc::new(SystemRunner::dry_run())
    } else {
        Arc::new(SystemRunner::new())
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let confirm: &dyn Confirm = if cli.non_interactive {
        &NonInteractive
    } else {
        &TerminalConfirm
    };

    match command {
        Commands::Install { target, packages } => {
            let pacman = Pacman::new(
                target,
                runner,
                confirm,
                &config,
                LockCoordinator::with_fs(Arc::clone(&clock)),
                clock,
            )
            .silent(cli.non_interactive);
            let outcome = pacman.pipeline(&packages).run()?;
            report(outcome)
        }
        Commands::Zfs { target, devices } => {
            let zfs = ZfsManager::new(&config.zfs, runner, RetryEngine::new(clock));
            let outcome = zfs.setup_zfs_system(&devices, &target)?;
            report(outcome)
        }
        Commands::WaitLock => {
            let spec = config.lock.wait_spec();
            LockCoordinator::with_fs(clock).await_free(&spec)?;
            println!("✓ {} is free", spec.resource_path.display());
            Ok(())
        }
        Commands::ShowConfig => {
            let json = serde_json::to_string_pretty(&config)
                .context("Failed to serialize settings to JSON")?;
            println!("{json}");
            Ok(())
        }
        Commands::Validate { path } => validate(&path),
    }
}

fn validate(path: &Path) -> Result<()> {
    info!("Validating settings file: {:?}", path);
    let config = InstallConfig::load_from_file(path)?;
    config.validate()?;
    info!("Settings validation successful");
    println!("✓ Settings file is valid: {}", path.display());
    Ok(())
}

/// Print the outcome; an aborted pipeline becomes an error.
fn report(outcome: PipelineOutcome) -> Result<()> {
    let outcome = outcome.into_result()?;
    for (step, warning) in outcome.best_effort_failures().iter().zip(outcome.warnings()) {
        println!("⚠ {step}: {warning}");
    }
    println!("✓ Finished: {}", outcome.status());
    Ok(())
}
