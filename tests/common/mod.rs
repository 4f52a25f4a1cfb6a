//! Shared fixtures: upstream repositories built with the real git CLI.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use gitsyncd::config::{Dir, Service};

/// A scratch upstream repository with a sparse-checkoutable sub-tree at
/// `<subdir>/conf/app.conf` and an `unrelated/` directory that must never
/// appear in a sparse working copy.
pub struct Upstream {
    dir: TempDir,
}

impl Upstream {
    pub fn new(subdir: &str) -> Upstream {
        let dir = TempDir::new().expect("create temp dir");
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "ops@example.org"]);
        git(dir.path(), &["config", "user.name", "Ops"]);
        let conf = dir.path().join(subdir).join("conf");
        std::fs::create_dir_all(&conf).expect("create conf dir");
        std::fs::write(conf.join("app.conf"), "v1\n").expect("write conf");
        let unrelated = dir.path().join("unrelated");
        std::fs::create_dir_all(&unrelated).expect("create unrelated dir");
        std::fs::write(unrelated.join("ignore.txt"), "x\n").expect("write unrelated");
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "initial"]);
        Upstream { dir }
    }

    pub fn url(&self) -> String {
        self.dir.path().display().to_string()
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn head(&self) -> String {
        git_out(self.dir.path(), &["rev-parse", "HEAD"])
    }

    /// Commit a new version of a file; returns the new head hash.
    pub fn commit_file(&self, rel: &str, content: &str, msg: &str) -> String {
        let path = self.dir.path().join(rel);
        std::fs::create_dir_all(path.parent().expect("file has parent")).expect("create dirs");
        std::fs::write(path, content).expect("write file");
        git(self.dir.path(), &["add", "."]);
        git(self.dir.path(), &["commit", "-m", msg]);
        self.head()
    }

    /// Simulate an outage: fetches fail until [`Upstream::bring_online`].
    pub fn take_offline(&self) {
        std::fs::rename(self.dir.path().join(".git"), self.dir.path().join(".git.off"))
            .expect("hide .git");
    }

    pub fn bring_online(&self) {
        std::fs::rename(self.dir.path().join(".git.off"), self.dir.path().join(".git"))
            .expect("restore .git");
    }
}

pub fn git(cwd: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

pub fn git_out(cwd: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("run git");
    assert!(out.status.success(), "git {:?}", args);
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A service for `host-a` tracking the given upstream.
pub fn service(upstream: &str, mount: PathBuf, subdir: &str, dirs: Vec<Dir>) -> Service {
    Service {
        machine: "host-a".into(),
        upstream: upstream.to_string(),
        branch: "main".into(),
        service: subdir.to_string(),
        mount,
        dirs,
        ..Service::default()
    }
}
