//! Bind-mount publication
//!
//! Consumers never read the working copy directly: each configured dir is
//! published as a read-only bind mount of `mount/service/source` at its
//! target. Mount state is probed through `/proc/self/mountinfo`; a mount
//! whose recorded root no longer matches its source is torn down and
//! re-bound.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use thiserror::Error;

use crate::config::Service;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("bind source {0} does not exist")]
    MissingSource(PathBuf),

    #[error("target {0} exists and is not an empty directory")]
    Occupied(PathBuf),

    #[error("{op} {path}: {err}")]
    Syscall {
        op: &'static str,
        path: PathBuf,
        err: nix::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Narrow publication capability injected into workers.
pub trait Mounter: Send + Sync {
    /// Ensure every dir of the service is published; returns the number of
    /// mounts newly established.
    fn publish(&self, service: &Service) -> Result<usize, MountError>;

    /// Best-effort unwind for shutdown paths; failures are logged.
    fn unmount(&self, service: &Service);
}

/// The real bind-mount driver. Needs to run as root.
pub struct BindMounts;

impl Mounter for BindMounts {
    fn publish(&self, service: &Service) -> Result<usize, MountError> {
        let table = mount_table()?;
        let mut fresh = 0;
        for dir in &service.dirs {
            let source = service.mount.join(&service.service).join(&dir.source);
            if !source.exists() {
                return Err(MountError::MissingSource(source));
            }
            match table.iter().find(|e| e.target == dir.target) {
                Some(entry) if entry.root == source => continue,
                Some(entry) => {
                    log::info!(
                        "re-binding {}: mounted from {}, want {}",
                        dir.target.display(),
                        entry.root.display(),
                        source.display()
                    );
                    umount2(&dir.target, MntFlags::MNT_DETACH).map_err(|err| {
                        MountError::Syscall {
                            op: "unmounting",
                            path: dir.target.clone(),
                            err,
                        }
                    })?;
                }
                None => prepare_target(dir.target.as_path(), dir.mode)?,
            }
            bind_readonly(&source, &dir.target)?;
            log::info!(
                "mounted {} read-only on {}",
                source.display(),
                dir.target.display()
            );
            fresh += 1;
        }
        Ok(fresh)
    }

    fn unmount(&self, service: &Service) {
        let table = match mount_table() {
            Ok(t) => t,
            Err(err) => {
                log::warn!("reading mount table: {err}");
                return;
            }
        };
        for dir in &service.dirs {
            if !table.iter().any(|e| e.target == dir.target) {
                continue;
            }
            match umount2(&dir.target, MntFlags::MNT_DETACH) {
                Ok(()) => log::info!("unmounted {}", dir.target.display()),
                Err(err) => log::warn!("unmounting {}: {err}", dir.target.display()),
            }
        }
    }
}

/// A pre-existing non-empty target that is not a mount is an error, never
/// silently overlaid.
fn prepare_target(target: &Path, mode: Option<u32>) -> Result<(), MountError> {
    if target.exists() {
        if !target.is_dir() || target.read_dir()?.next().is_some() {
            return Err(MountError::Occupied(target.to_path_buf()));
        }
        return Ok(());
    }
    fs::create_dir_all(target)?;
    if let Some(mode) = mode {
        fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

fn bind_readonly(source: &Path, target: &Path) -> Result<(), MountError> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|err| MountError::Syscall {
        op: "binding",
        path: target.to_path_buf(),
        err,
    })?;
    // A bind mount ignores MS_RDONLY on creation; it takes effect on remount.
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|err| MountError::Syscall {
        op: "remounting read-only",
        path: target.to_path_buf(),
        err,
    })
}

#[derive(Debug, PartialEq, Eq)]
struct MountEntry {
    /// Path of the bound directory within its filesystem.
    root: PathBuf,
    /// Where it is mounted.
    target: PathBuf,
}

fn mount_table() -> Result<Vec<MountEntry>, MountError> {
    let content = fs::read_to_string("/proc/self/mountinfo")?;
    Ok(parse_mountinfo(&content))
}

/// Parse `/proc/self/mountinfo` lines; only the root and mount-point
/// fields matter here.
fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(' ');
            let root = fields.nth(3)?;
            let target = fields.next()?;
            Some(MountEntry {
                root: PathBuf::from(unescape(root)),
                target: PathBuf::from(unescape(target)),
            })
        })
        .collect()
}

/// Mountinfo escapes space, tab, newline and backslash as \ooo octal.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(b) => out.push(b as char),
            Err(_) => {
                out.push(c);
                out.push_str(&digits);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mountinfo_lines() {
        let content = "\
36 25 0:30 / /sys rw,nosuid shared:7 - sysfs sysfs rw
612 25 8:1 /srv/app/etc/app/conf /etc/app.d ro,relatime shared:1 - ext4 /dev/sda1 rw
613 25 8:1 /srv/with\\040space /mnt/with\\040space rw - ext4 /dev/sda1 rw
";
        let table = parse_mountinfo(content);
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].target, PathBuf::from("/sys"));
        assert_eq!(table[1].root, PathBuf::from("/srv/app/etc/app/conf"));
        assert_eq!(table[1].target, PathBuf::from("/etc/app.d"));
        assert_eq!(table[2].root, PathBuf::from("/srv/with space"));
        assert_eq!(table[2].target, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn unescapes_octal() {
        assert_eq!(unescape("a\\040b"), "a b");
        assert_eq!(unescape("plain"), "plain");
        assert_eq!(unescape("tail\\"), "tail\\");
    }

    #[test]
    fn prepare_rejects_occupied_target() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("file"), "x").unwrap();
        assert!(matches!(
            prepare_target(&target, None),
            Err(MountError::Occupied(_))
        ));
    }

    #[test]
    fn unmount_skips_targets_that_are_not_mounted() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("published");
        fs::create_dir(&target).unwrap();
        let service = Service {
            machine: "host-a".into(),
            service: "etc/app".into(),
            mount: tmp.path().join("srv"),
            dirs: vec![crate::config::Dir {
                source: "conf".into(),
                target: target.clone(),
                mode: None,
            }],
            ..Service::default()
        };

        BindMounts.unmount(&service);

        // The directory is left alone; nothing was mounted on it.
        assert!(target.is_dir());
    }

    #[test]
    fn prepare_accepts_empty_or_missing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = tmp.path().join("empty");
        fs::create_dir(&empty).unwrap();
        prepare_target(&empty, None).unwrap();

        let missing = tmp.path().join("missing");
        prepare_target(&missing, Some(0o755)).unwrap();
        assert!(missing.is_dir());
    }
}
