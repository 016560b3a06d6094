//! Settings file handling.
//!
//! The installer reads one JSON settings file into an [`InstallConfig`]
//! snapshot. Every key is optional: a missing key (or a missing section, or
//! no file at all) falls back to the documented default. The snapshot is then
//! passed explicitly to each component; nothing looks settings up globally.

use crate::engine::{BatchConfig, LockWaitSpec, RetryPolicy};
use crate::error::ProvisionError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry parameters as they appear in the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetrySettings {
    pub const fn new(max_attempts: u32, base_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            backoff_multiplier,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Policy with these parameters that retries every error.
    pub fn policy<E>(&self) -> Result<RetryPolicy<E>, ProvisionError> {
        RetryPolicy::new(self.max_attempts, self.base_delay(), self.backoff_multiplier)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::new(3, 5_000, 2.0)
    }
}

/// Package installation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSettings {
    /// Packages per pacstrap invocation
    pub batch_size: usize,
    /// Retries of single pacman commands
    pub command_retry: RetrySettings,
    /// Retries of one pacstrap batch
    pub batch_retry: RetrySettings,
    /// Substrings (case-insensitive) that mark a pacman failure as a sync problem
    pub transient_markers: Vec<String>,
    /// pacman.conf handed to pacstrap
    pub pacman_conf: PathBuf,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            command_retry: RetrySettings::new(3, 2_000, 2.0),
            batch_retry: RetrySettings::new(3, 5_000, 2.0),
            transient_markers: vec![
                "failed to synchronize".to_string(),
                "failed retrieving file".to_string(),
            ],
            pacman_conf: PathBuf::from("/etc/pacman.conf"),
        }
    }
}

impl PackageSettings {
    pub fn batch_config(&self) -> Result<BatchConfig, ProvisionError> {
        BatchConfig::new(self.batch_size)
    }
}

/// Package database lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub path: PathBuf,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/pacman/db.lck"),
            poll_interval_ms: 250,
            timeout_secs: 600,
        }
    }
}

impl LockSettings {
    pub fn wait_spec(&self) -> LockWaitSpec {
        LockWaitSpec::new(
            self.path.clone(),
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// ZFS provisioning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZfsSettings {
    pub pool_name: String,
    pub compression: String,
    pub boot_environment: String,
    pub encryption: bool,
    pub encryption_password: String,
    pub ashift: u8,
    pub swap_size_gb: u32,
    /// Retries for package installs and initramfs rebuilds inside the target
    pub retry: RetrySettings,
}

impl Default for ZfsSettings {
    fn default() -> Self {
        Self {
            pool_name: "rpool".to_string(),
            compression: "lz4".to_string(),
            boot_environment: "default".to_string(),
            encryption: false,
            encryption_password: String::new(),
            ashift: 12,
            swap_size_gb: 4,
            retry: RetrySettings::default(),
        }
    }
}

impl ZfsSettings {
    /// Dataset holding the root filesystem, e.g. `rpool/ROOT/default`
    pub fn root_dataset(&self) -> String {
        format!("{}/ROOT/{}", self.pool_name, self.boot_environment)
    }
}

/// Complete settings snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub packages: PackageSettings,
    pub lock: LockSettings,
    pub zfs: ZfsSettings,
}

impl InstallConfig {
    /// Load settings from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse settings JSON")?;

        Ok(config)
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Save settings to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize settings to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write settings to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Check ranges the engine relies on.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.packages.batch_size == 0 {
            return Err(ProvisionError::config("packages.batch_size must be at least 1"));
        }

        for (key, retry) in [
            ("packages.command_retry", &self.packages.command_retry),
            ("packages.batch_retry", &self.packages.batch_retry),
            ("zfs.retry", &self.zfs.retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(ProvisionError::config(format!(
                    "{key}.max_attempts must be at least 1"
                )));
            }
            if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
                return Err(ProvisionError::config(format!(
                    "{key}.backoff_multiplier must be at least 1"
                )));
            }
        }

        if self.lock.poll_interval_ms == 0 {
            return Err(ProvisionError::config("lock.poll_interval_ms must be positive"));
        }

        if self.zfs.pool_name.trim().is_empty() {
            return Err(ProvisionError::config("zfs.pool_name must be specified"));
        }
        if self.zfs.pool_name.contains(char::is_whitespace) || self.zfs.pool_name.contains('/') {
            return Err(ProvisionError::config(
                "zfs.pool_name cannot contain whitespace or '/'",
            ));
        }
        if self.zfs.encryption && self.zfs.encryption_password.is_empty() {
            return Err(ProvisionError::config(
                "zfs.encryption requires zfs.encryption_password",
            ));
        }

        Ok(())
    }
}
