//! OS package installation
//!
//! Services may name a package that must be present before their first
//! checkout. Installation is delegated to whichever package manager the
//! host carries; a failure marks the one service broken and never grounds
//! the fleet.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum PkgError {
    #[error("no supported package manager found on this host")]
    NoManager,

    #[error("{manager} install {pkg} failed: {stderr}")]
    Install {
        manager: &'static str,
        pkg: String,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Manager {
    Apt,
    Dnf,
    Yum,
    Pacman,
}

impl Manager {
    fn detect() -> Option<Manager> {
        const KNOWN: &[(&str, Manager)] = &[
            ("/usr/bin/apt-get", Manager::Apt),
            ("/usr/bin/dnf", Manager::Dnf),
            ("/usr/bin/yum", Manager::Yum),
            ("/usr/bin/pacman", Manager::Pacman),
        ];
        KNOWN
            .iter()
            .find(|(path, _)| Path::new(path).exists())
            .map(|(_, m)| *m)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Pacman => "pacman",
        }
    }

    fn install_args(&self, pkg: &str) -> Vec<String> {
        match self {
            Self::Apt | Self::Dnf | Self::Yum => vec!["install".into(), "-y".into(), pkg.into()],
            Self::Pacman => vec!["-S".into(), "--noconfirm".into(), pkg.into()],
        }
    }
}

/// The host's package manager, detected once at startup.
pub struct OsPkg {
    manager: Option<Manager>,
}

impl OsPkg {
    pub fn detect() -> OsPkg {
        let manager = Manager::detect();
        match manager {
            Some(m) => log::debug!("package manager: {}", m.name()),
            None => log::debug!("no package manager detected"),
        }
        OsPkg { manager }
    }

    pub async fn install(&self, pkg: &str) -> Result<(), PkgError> {
        let manager = self.manager.ok_or(PkgError::NoManager)?;
        log::info!("installing package {pkg} via {}", manager.name());
        let out = Command::new(manager.name())
            .args(manager.install_args(pkg))
            .env("DEBIAN_FRONTEND", "noninteractive")
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(PkgError::Install {
                manager: manager.name(),
                pkg: pkg.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_args_shape() {
        assert_eq!(Manager::Apt.install_args("vim"), ["install", "-y", "vim"]);
        assert_eq!(
            Manager::Pacman.install_args("vim"),
            ["-S", "--noconfirm", "vim"]
        );
    }
}
