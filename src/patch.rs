//! Line-oriented edits of configuration text.
//!
//! Each edit is idempotent: applying it to already-patched text returns the
//! text unchanged. [`patch_file`] only writes when the content changed.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Append an INI-style section (`[name]` plus body lines) unless present.
pub fn ensure_section(content: &str, section: &str, body: &[&str]) -> String {
    let header = format!("[{section}]");
    if content.lines().any(|line| line.trim() == header) {
        return content.to_string();
    }

    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&header);
    out.push('\n');
    for line in body {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Insert `hook` into the active `HOOKS=(...)` line of mkinitcpio.conf.
///
/// The hook goes right before `filesystems`, or at the end when there is no
/// `filesystems` hook. Commented-out `HOOKS` lines are ignored.
pub fn insert_mkinitcpio_hook(content: &str, hook: &str) -> String {
    map_lines(content, |line| {
        let trimmed = line.trim_start();
        let inner = trimmed.strip_prefix("HOOKS=(")?.strip_suffix(')')?;

        let mut hooks: Vec<&str> = inner.split_whitespace().collect();
        if hooks.contains(&hook) {
            return None;
        }
        match hooks.iter().position(|h| *h == "filesystems") {
            Some(pos) => hooks.insert(pos, hook),
            None => hooks.push(hook),
        }
        Some(format!("HOOKS=({})", hooks.join(" ")))
    })
}

/// Append kernel parameters to `GRUB_CMDLINE_LINUX="..."`.
///
/// Parameters already on the line are not repeated. If the variable is
/// missing entirely it is appended.
pub fn append_kernel_params(content: &str, params: &[&str]) -> String {
    const KEY: &str = "GRUB_CMDLINE_LINUX=";

    if !content.lines().any(|l| l.trim_start().starts_with(KEY)) {
        let mut out = content.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("{KEY}\"{}\"\n", params.join(" ")));
        return out;
    }

    map_lines(content, |line| {
        let value = line.trim_start().strip_prefix(KEY)?;
        let value = value.trim().trim_matches('"');

        let mut current: Vec<&str> = value.split_whitespace().collect();
        let missing: Vec<&str> = params
            .iter()
            .copied()
            .filter(|p| !current.contains(p))
            .collect();
        if missing.is_empty() {
            return None;
        }
        current.extend(missing);
        Some(format!("{KEY}\"{}\"", current.join(" ")))
    })
}

/// Rewrite lines for which `edit` returns a replacement; keep the rest.
fn map_lines(content: &str, mut edit: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(content.len() + 32);
    for line in content.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        match edit(body) {
            Some(replacement) => {
                out.push_str(&replacement);
                out.push_str(newline);
            }
            None => out.push_str(line),
        }
    }
    out
}

/// Apply `edit` to the file at `path`, writing only if something changed.
///
/// Returns whether the file was modified.
pub fn patch_file(path: &Path, edit: impl FnOnce(&str) -> String) -> Result<bool> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let patched = edit(&content);
    if patched == content {
        debug!("{} already up to date", path.display());
        return Ok(false);
    }

    fs::write(path, patched).with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Patched {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MKINITCPIO: &str = "\
# vim:set ft=sh
MODULES=()
#HOOKS=(base udev)
HOOKS=(base udev autodetect modconf block keyboard filesystems fsck)
";

    #[test]
    fn test_ensure_section_appends_once() {
        let conf = "[core]\nInclude = /etc/pacman.d/mirrorlist\n";
        let body = ["Server = https://archzfs.com/$repo/$arch"];

        let patched = ensure_section(conf, "archzfs", &body);
        assert!(patched.ends_with("\n[archzfs]\nServer = https://archzfs.com/$repo/$arch\n"));
        assert!(patched.starts_with(conf));
        assert_eq!(ensure_section(&patched, "archzfs", &body), patched);
    }

    #[test]
    fn test_ensure_section_handles_missing_trailing_newline() {
        let patched = ensure_section("[core]", "archzfs", &["Server = x"]);
        assert_eq!(patched, "[core]\n\n[archzfs]\nServer = x\n");
    }

    #[test]
    fn test_insert_hook_before_filesystems() {
        let patched = insert_mkinitcpio_hook(MKINITCPIO, "zfs");
        assert!(patched.contains(
            "\nHOOKS=(base udev autodetect modconf block keyboard zfs filesystems fsck)\n"
        ));
        assert!(patched.contains("#HOOKS=(base udev)\n"));
        assert_eq!(insert_mkinitcpio_hook(&patched, "zfs"), patched);
    }

    #[test]
    fn test_insert_hook_without_filesystems_appends() {
        let patched = insert_mkinitcpio_hook("HOOKS=(base udev)", "zfs");
        assert_eq!(patched, "HOOKS=(base udev zfs)");
    }

    #[test]
    fn test_append_kernel_params() {
        let grub = "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX=\"\"\n";
        let patched = append_kernel_params(grub, &["root=ZFS=rpool/ROOT/default", "zfs_force=1"]);
        assert_eq!(
            patched,
            "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX=\"root=ZFS=rpool/ROOT/default zfs_force=1\"\n"
        );
        assert_eq!(
            append_kernel_params(&patched, &["zfs_force=1"]),
            patched
        );
    }

    #[test]
    fn test_append_kernel_params_keeps_existing() {
        let grub = "GRUB_CMDLINE_LINUX=\"quiet\"\n";
        assert_eq!(
            append_kernel_params(grub, &["zfs_force=1"]),
            "GRUB_CMDLINE_LINUX=\"quiet zfs_force=1\"\n"
        );
    }

    #[test]
    fn test_append_kernel_params_adds_missing_variable() {
        assert_eq!(
            append_kernel_params("GRUB_TIMEOUT=5", &["zfs_force=1"]),
            "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX=\"zfs_force=1\"\n"
        );
    }

    #[test]
    fn test_patch_file_writes_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mkinitcpio.conf");
        fs::write(&path, MKINITCPIO).unwrap();

        assert!(patch_file(&path, |c| insert_mkinitcpio_hook(c, "zfs")).unwrap());
        assert!(!patch_file(&path, |c| insert_mkinitcpio_hook(c, "zfs")).unwrap());
        assert!(fs::read_to_string(&path).unwrap().contains("zfs filesystems"));
    }

    #[test]
    fn test_patch_missing_file_fails() {
        let err = patch_file(Path::new("/nonexistent/grub"), |c| c.to_string()).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/grub"));
    }
}
