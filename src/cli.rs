use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Provisor - resilient package and ZFS provisioning for Arch Linux installs
#[derive(Parser)]
#[command(name = "provisor")]
#[command(about = "Install packages and provision ZFS roots with retries and lock handling")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: log every command instead of executing it.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Settings file (JSON). Missing keys use built-in defaults.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Never ask to retry; the first fatal failure ends the run.
    #[arg(long, global = true)]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install packages into the target with pacstrap
    Install {
        /// Mounted root of the new system
        #[arg(short, long, default_value = "/mnt")]
        target: PathBuf,

        /// Packages to install
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Create a ZFS pool on the given devices and make it bootable
    Zfs {
        /// Mounted root of the new system
        #[arg(short, long, default_value = "/mnt")]
        target: PathBuf,

        /// Devices for the pool (e.g., /dev/sda2)
        #[arg(required = true)]
        devices: Vec<String>,
    },
    /// Wait until the pacman database lock is released
    WaitLock,
    /// Validate a settings file
    Validate {
        /// Path to settings file to validate
        path: PathBuf,
    },
    /// Print the effective settings as JSON
    ShowConfig,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
