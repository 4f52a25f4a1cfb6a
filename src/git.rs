//! Git driver
//!
//! Maintains a cone sparse checkout of `upstream@branch` at the service's
//! mount: only the configured sub-tree (plus top-level files) exists in the
//! working tree. All operations shell out to the `git` binary; a hard reset
//! makes updates atomic from a reader's point of view: the tree is either
//! entirely old or entirely new.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

use crate::config::Service;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} failed: {stderr}")]
    Failed { args: String, stderr: String },

    #[error("invalid commit hash {0:?}")]
    InvalidHash(String),

    #[error("unknown {kind} {name:?}")]
    UnknownOwner { kind: &'static str, name: String },

    #[error("changing ownership of {path}: {err}")]
    Chown { path: PathBuf, err: nix::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// True for a full 40-character hexadecimal object identifier.
pub fn is_hash(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Result of a [`GitCmd::pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pull {
    pub hash: String,
    pub changed: bool,
}

/// Per-service git working copy. Owns every path under `mount` and never
/// touches anything outside it.
pub struct GitCmd {
    upstream: String,
    branch: String,
    mount: PathBuf,
    service: String,
    user: Option<String>,
    group: Option<String>,
}

impl GitCmd {
    pub fn new(service: &Service) -> GitCmd {
        GitCmd {
            upstream: service.upstream.clone(),
            branch: service.branch.clone(),
            mount: service.mount.clone(),
            service: service.service.clone(),
            user: service.user.clone(),
            group: service.group.clone(),
        }
    }

    /// Absolute path of the working copy root.
    pub fn repo(&self) -> &Path {
        &self.mount
    }

    fn initialized(&self) -> bool {
        self.mount.join(".git").exists()
    }

    fn origin(&self) -> String {
        format!("origin/{}", self.branch)
    }

    async fn git(&self, args: &[&str]) -> Result<String, GitError> {
        log::debug!("running git {:?} in {}", args, self.mount.display());
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.mount)
            .output()
            .await?;
        if !out.status.success() {
            return Err(GitError::Failed {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Create the working copy if it does not exist yet: an empty
    /// repository with `upstream` as its remote, restricted to the sparse
    /// sub-tree, reset hard to the remote branch head. On an initialized
    /// repo this only revalidates the sparse pattern.
    pub async fn checkout(&self) -> Result<(), GitError> {
        if self.initialized() {
            self.git(&["sparse-checkout", "set", "--cone", &self.service])
                .await?;
            return Ok(());
        }
        std::fs::create_dir_all(&self.mount)?;
        self.git(&["init"]).await?;
        self.git(&["remote", "add", "origin", &self.upstream]).await?;
        self.git(&["sparse-checkout", "set", "--cone", &self.service])
            .await?;
        self.git(&["fetch", "origin", &self.branch]).await?;
        self.git(&["reset", "--hard", &self.origin()]).await?;
        self.chown_tree()?;
        Ok(())
    }

    /// Fetch and, when the remote head moved, hard-reset to it. Returns the
    /// head hash and whether the tree changed.
    pub async fn pull(&self) -> Result<Pull, GitError> {
        self.git(&["fetch", "origin", &self.branch]).await?;
        let local = self.git(&["rev-parse", "@"]).await?;
        let remote = self.git(&["rev-parse", &self.origin()]).await?;
        if local == remote {
            return Ok(Pull {
                hash: local,
                changed: false,
            });
        }
        self.git(&["reset", "--hard", &remote]).await?;
        self.chown_tree()?;
        Ok(Pull {
            hash: remote,
            changed: true,
        })
    }

    /// Hard-reset the tree to `hash`. The hash must be a full object
    /// identifier and reachable after a fetch.
    pub async fn rollback(&self, hash: &str) -> Result<(), GitError> {
        if !is_hash(hash) {
            return Err(GitError::InvalidHash(hash.to_string()));
        }
        self.git(&["fetch", "origin", &self.branch]).await?;
        self.git(&["reset", "--hard", hash]).await?;
        self.chown_tree()?;
        Ok(())
    }

    /// Current head object identifier, or empty when uninitialized.
    pub async fn hash(&self) -> String {
        if !self.initialized() {
            return String::new();
        }
        self.git(&["rev-parse", "@"]).await.unwrap_or_default()
    }

    /// Apply the configured ownership to the sparse sub-tree after a
    /// mutation. No-op when no user is configured.
    fn chown_tree(&self) -> Result<(), GitError> {
        let Some(user) = &self.user else {
            return Ok(());
        };
        let uid = resolve_user(user).ok_or(GitError::UnknownOwner {
            kind: "user",
            name: user.clone(),
        })?;
        let gid = match &self.group {
            Some(group) => Some(resolve_group(group).ok_or(GitError::UnknownOwner {
                kind: "group",
                name: group.clone(),
            })?),
            None => None,
        };
        let root = self.mount.join(&self.service);
        if root.exists() {
            chown_recursive(&root, uid, gid)?;
        }
        Ok(())
    }
}

fn chown_recursive(path: &Path, uid: u32, gid: Option<u32>) -> Result<(), GitError> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        gid.map(nix::unistd::Gid::from_raw),
    )
    .map_err(|err| GitError::Chown {
        path: path.to_path_buf(),
        err,
    })?;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_recursive(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// Resolve a username to a UID, trying a numeric id first.
fn resolve_user(user: &str) -> Option<u32> {
    if let Ok(uid) = user.parse::<u32>() {
        return Some(uid);
    }
    let name = CString::new(user).ok()?;
    unsafe {
        let pwd = libc::getpwnam(name.as_ptr());
        if pwd.is_null() {
            None
        } else {
            Some((*pwd).pw_uid)
        }
    }
}

/// Resolve a group name to a GID, trying a numeric id first.
fn resolve_group(group: &str) -> Option<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Some(gid);
    }
    let name = CString::new(group).ok()?;
    unsafe {
        let grp = libc::getgrnam(name.as_ptr());
        if grp.is_null() {
            None
        } else {
            Some((*grp).gr_gid)
        }
    }
}
