//! ZFS root provisioning
//!
//! Turns the ZFS settings into a staged pipeline: pool, datasets, optional
//! encryption and swap, mounting, boot configuration, packages inside the
//! target, initramfs, and bootloader.
//!
//! # Failure modes
//!
//! | Step                         | Mode        |
//! |------------------------------|-------------|
//! | create-pool, ROOT, boot env  | Hard        |
//! | home, var, var/lib, var/log  | BestEffort  |
//! | setup-encryption             | Hard        |
//! | create-swap                  | BestEffort  |
//! | mount, boot, packages, grub  | Hard        |
//! | install-linux-headers        | BestEffort  |
//!
//! A missing optional dataset leaves a working system; a missing pool or an
//! unencrypted dataset the operator asked to encrypt does not.

use crate::command::{argv, CommandError, CommandRunner};
use crate::config::ZfsSettings;
use crate::engine::{Pipeline, PipelineOutcome, RetryEngine, RetryPolicy, Step};
use crate::patch::{append_kernel_params, ensure_section, insert_mkinitcpio_hook, patch_file};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Datasets below the pool root that a system can live without
const COMMON_DATASETS: &[(&str, &str)] = &[
    ("home", "/home"),
    ("var", "/var"),
    ("var/lib", "/var/lib"),
    ("var/log", "/var/log"),
];

const BOOT_SERVICES: &[&str] = &["zfs.target", "zfs-import-cache", "zfs-mount", "zfs-import.target"];

const ARCHZFS_KEY: &str = "F75D9D76";
const ARCHZFS_SERVER: &str = "Server = https://archzfs.com/$repo/$arch";
const ZFS_PACKAGES: &[&str] = &["zfs-dkms", "zfs-utils"];

pub struct ZfsManager<'a> {
    settings: &'a ZfsSettings,
    runner: Arc<dyn CommandRunner>,
    retry: RetryEngine,
}

impl<'a> ZfsManager<'a> {
    pub fn new(settings: &'a ZfsSettings, runner: Arc<dyn CommandRunner>, retry: RetryEngine) -> Self {
        Self {
            settings,
            runner,
            retry,
        }
    }

    fn exec(&self, parts: &[&str]) -> Result<()> {
        self.runner
            .run(&argv(parts.iter().copied()))
            .map(drop)
            .with_context(|| format!("`{}` failed", parts.join(" ")))
    }

    /// Run a command in the target, retrying any non-zero exit.
    fn exec_retrying(&self, parts: &[&str]) -> Result<()> {
        let policy: RetryPolicy<CommandError> = self
            .settings
            .retry
            .policy()?
            .with_classifier(CommandError::is_exit_failure);
        let command = argv(parts.iter().copied());

        self.retry
            .execute(|| self.runner.run(&command), &policy)
            .map(drop)
            .map_err(|failure| anyhow::Error::new(failure.into_provision_error()))
            .with_context(|| format!("`{}` failed", parts.join(" ")))
    }

    /// Edit a file in the target; only logged in dry-run mode.
    fn patch(&self, path: &Path, edit: impl FnOnce(&str) -> String) -> Result<()> {
        if self.runner.is_dry_run() {
            info!("[dry-run] patch {}", path.display());
            return Ok(());
        }
        patch_file(path, edit).map(drop)
    }

    fn chroot(&self, target: &Path, parts: &[&str]) -> Vec<String> {
        let mut cmd = vec!["arch-chroot".to_string(), target.display().to_string()];
        cmd.extend(parts.iter().map(|p| p.to_string()));
        cmd
    }

    fn exec_in(&self, target: &Path, parts: &[&str]) -> Result<()> {
        let cmd = self.chroot(target, parts);
        let refs: Vec<&str> = cmd.iter().map(String::as_str).collect();
        self.exec(&refs)
    }

    fn exec_in_retrying(&self, target: &Path, parts: &[&str]) -> Result<()> {
        let cmd = self.chroot(target, parts);
        let refs: Vec<&str> = cmd.iter().map(String::as_str).collect();
        self.exec_retrying(&refs)
    }

    pub fn create_pool(&self, devices: &[String]) -> Result<()> {
        if devices.is_empty() {
            anyhow::bail!("No devices given for pool {}", self.settings.pool_name);
        }

        let ashift = format!("ashift={}", self.settings.ashift);
        let compression = format!("compression={}", self.settings.compression);
        let mut cmd: Vec<&str> = vec![
            "zpool", "create", "-f",
            "-o", ashift.as_str(),
            "-o", "feature@encryption=enabled",
            "-O", compression.as_str(),
            "-O", "atime=off",
            "-O", "relatime=on",
            "-O", "xattr=sa",
            "-O", "mountpoint=none",
            self.settings.pool_name.as_str(),
        ];
        cmd.extend(devices.iter().map(String::as_str));

        debug!("Creating ZFS pool with command: {}", cmd.join(" "));
        self.exec(&cmd)?;
        info!("ZFS pool {} created", self.settings.pool_name);
        Ok(())
    }

    /// `<pool>/ROOT`, the container for boot environments
    pub fn create_root_container(&self) -> Result<()> {
        let dataset = format!("{}/ROOT", self.settings.pool_name);
        self.exec(&["zfs", "create", "-o", "mountpoint=none", &dataset])
    }

    pub fn create_boot_environment(&self) -> Result<()> {
        let compression = format!("compression={}", self.settings.compression);
        let dataset = self.settings.root_dataset();
        self.exec(&[
            "zfs", "create",
            "-o", "mountpoint=/",
            "-o", "canmount=noauto",
            "-o", &compression,
            &dataset,
        ])
    }

    pub fn create_dataset(&self, name: &str, mountpoint: &str) -> Result<()> {
        let dataset = format!("{}/{}", self.settings.pool_name, name);
        let mountpoint = format!("mountpoint={mountpoint}");
        self.exec(&["zfs", "create", "-o", &mountpoint, &dataset])
    }

    /// Create `<pool>/encrypted` with the passphrase fed on stdin.
    ///
    /// A no-op when encryption is off or no passphrase is set.
    pub fn setup_encryption(&self) -> Result<()> {
        if !self.settings.encryption || self.settings.encryption_password.is_empty() {
            debug!("ZFS encryption is disabled or no password provided, skipping");
            return Ok(());
        }

        let dataset = format!("{}/encrypted", self.settings.pool_name);
        let cmd = argv([
            "zfs", "create",
            "-o", "encryption=aes-256-gcm",
            "-o", "keyformat=passphrase",
            "-o", "keylocation=prompt",
            "-o", "mountpoint=/encrypted",
            dataset.as_str(),
        ]);
        // zfs asks for the passphrase twice
        let password = &self.settings.encryption_password;
        let input = format!("{password}\n{password}\n");

        self.runner
            .run_with_input(&cmd, Some(&input))
            .context("Failed to create encrypted dataset")?;
        info!("ZFS encryption configured on {}", dataset);
        Ok(())
    }

    pub fn create_swap(&self) -> Result<()> {
        let pool = &self.settings.pool_name;
        let swap = format!("{pool}/swap");
        let volume = format!("{pool}/swap/swapfile");
        let size = format!("{}G", self.settings.swap_size_gb);

        self.exec(&[
            "zfs", "create",
            "-o", "compression=zle",
            "-o", "logbias=throughput",
            "-o", "sync=always",
            "-o", "primarycache=metadata",
            "-o", "secondarycache=none",
            "-o", "com.sun:auto-snapshot=false",
            &swap,
        ])?;
        self.exec(&["zfs", "create", "-V", &size, "-b", "4K", &volume])?;
        self.exec(&["mkswap", &format!("/dev/zvol/{volume}")])?;
        info!("ZFS swap volume created ({})", size);
        Ok(())
    }

    /// Re-import the pool under `target` and mount everything.
    pub fn mount_datasets(&self, target: &Path) -> Result<()> {
        let pool = &self.settings.pool_name;
        let altroot = target.display().to_string();

        self.exec(&["zpool", "export", pool])?;
        self.exec(&["zpool", "import", "-R", &altroot, pool])?;
        self.exec(&["zfs", "mount", &self.settings.root_dataset()])?;
        self.exec(&["zfs", "mount", "-a"])?;
        info!("ZFS datasets mounted under {}", altroot);
        Ok(())
    }

    pub fn configure_boot(&self, target: &Path) -> Result<()> {
        let pool = &self.settings.pool_name;
        let bootfs = format!("bootfs={}", self.settings.root_dataset());
        self.exec(&["zpool", "set", &bootfs, pool])?;

        let cache_dir = target.join("etc/zfs");
        if !self.runner.is_dry_run() {
            fs::create_dir_all(&cache_dir)
                .with_context(|| format!("Failed to create {}", cache_dir.display()))?;
        }
        self.exec(&["zpool", "set", "cachefile=/etc/zfs/zpool.cache", pool])?;

        let root = target.display().to_string();
        for &service in BOOT_SERVICES {
            self.exec(&["systemctl", "--root", &root, "enable", service])?;
        }
        info!("ZFS boot configuration completed");
        Ok(())
    }

    pub fn install_headers(&self, target: &Path) -> Result<()> {
        self.exec_in(target, &["pacman", "-S", "--noconfirm", "linux-headers"])
    }

    /// Install zfs-dkms and zfs-utils, falling back to the archzfs repository.
    pub fn install_zfs_packages(&self, target: &Path) -> Result<()> {
        let mut all = vec!["pacman", "-S", "--noconfirm"];
        all.extend_from_slice(ZFS_PACKAGES);
        let Err(err) = self.exec_in(target, &all) else {
            return Ok(());
        };
        warn!("Official repositories failed ({:#}), trying archzfs", err);

        let pacman_conf = target.join("etc/pacman.conf");
        self.patch(&pacman_conf, |c| ensure_section(c, "archzfs", &[ARCHZFS_SERVER]))?;

        if let Err(e) = self
            .exec_in(target, &["pacman-key", "-r", ARCHZFS_KEY])
            .and_then(|()| self.exec_in(target, &["pacman-key", "--lsign-key", ARCHZFS_KEY]))
        {
            warn!("Could not import archzfs key: {:#}", e);
        }
        if let Err(e) = self.exec_in(target, &["pacman", "-Syy"]) {
            warn!("Failed to update package database: {:#}", e);
        }

        for &package in ZFS_PACKAGES {
            info!("Installing {}", package);
            self.exec_in_retrying(target, &["pacman", "-S", "--noconfirm", package])?;
        }
        Ok(())
    }

    /// Add the zfs hook to mkinitcpio.conf and rebuild every preset.
    pub fn configure_initramfs(&self, target: &Path) -> Result<()> {
        let conf = target.join("etc/mkinitcpio.conf");
        self.patch(&conf, |c| insert_mkinitcpio_hook(c, "zfs"))?;
        self.exec_in_retrying(target, &["mkinitcpio", "-P"])
    }

    pub fn configure_bootloader(&self, target: &Path) -> Result<()> {
        self.exec_in(target, &["pacman", "-S", "--noconfirm", "grub"])?;

        let root_param = format!("root=ZFS={}", self.settings.root_dataset());
        let grub_default = target.join("etc/default/grub");
        self.patch(&grub_default, |c| {
            append_kernel_params(c, &[root_param.as_str(), "zfs_force=1"])
        })?;

        self.exec_in(
            target,
            &[
                "grub-install",
                "--target=x86_64-efi",
                "--efi-directory=/boot",
                "--bootloader-id=GRUB",
            ],
        )?;
        self.exec_in(target, &["grub-mkconfig", "-o", "/boot/grub/grub.cfg"])
    }

    /// Every provisioning step, in order, with its failure mode.
    pub fn pipeline<'p>(&'p self, devices: &'p [String], target: &'p Path) -> Pipeline<'p> {
        let mut pipeline = Pipeline::new("zfs")
            .step(Step::hard("create-pool", move || self.create_pool(devices)))
            .step(Step::hard("create-root-container", move || self.create_root_container()))
            .step(Step::hard("create-boot-environment", move || {
                self.create_boot_environment()
            }));

        for &(name, mountpoint) in COMMON_DATASETS {
            pipeline = pipeline.step(Step::best_effort(format!("create-dataset {name}"), move || {
                self.create_dataset(name, mountpoint)
            }));
        }

        pipeline
            .step(Step::hard("setup-encryption", move || self.setup_encryption()))
            .step(Step::best_effort("create-swap", move || self.create_swap()))
            .step(Step::hard("mount-datasets", move || self.mount_datasets(target)))
            .step(Step::hard("configure-boot", move || self.configure_boot(target)))
            .step(Step::best_effort("install-linux-headers", move || {
                self.install_headers(target)
            }))
            .step(Step::hard("install-zfs-packages", move || {
                self.install_zfs_packages(target)
            }))
            .step(Step::hard("configure-initramfs", move || self.configure_initramfs(target)))
            .step(Step::hard("configure-bootloader", move || {
                self.configure_bootloader(target)
            }))
    }

    /// Run the whole provisioning pipeline.
    pub fn setup_zfs_system(&self, devices: &[String], target: &Path) -> Result<PipelineOutcome> {
        let outcome = self.pipeline(devices, target).run()?;
        for (step, warning) in outcome.best_effort_failures().iter().zip(outcome.warnings()) {
            warn!("Skipped optional step {}: {}", step, warning);
        }
        if outcome.is_success() {
            info!("ZFS system setup completed ({})", outcome.status());
        }
        Ok(outcome)
    }
}
