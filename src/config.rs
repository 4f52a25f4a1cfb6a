//! Configuration model
//!
//! The config document declares a [global] template, the [[services]] to
//! reconcile and the [keys] consumed by the control-plane front-end. Each
//! service is produced by overlaying its own fields onto the global
//! template: an explicit field in the service wins, otherwise the global
//! supplies it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::state::{ServiceState, State};
use crate::unit::{Action, ActionError};

/// Branch tracked when neither the service nor the global names one.
pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {err}")]
    Read { path: PathBuf, err: std::io::Error },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("service {service:?}: missing field {field}")]
    MissingField { service: String, field: &'static str },

    #[error("service {service:?}: mount {mount} is not an absolute path")]
    MountNotAbsolute { service: String, mount: PathBuf },

    #[error("service {service:?}: sparse directory {dir:?} must be relative")]
    SparseDirAbsolute { service: String, dir: String },

    #[error("service {service:?}: bind target {target} is not an absolute path")]
    TargetNotAbsolute { service: String, target: PathBuf },

    #[error("service {service:?}: bind target {target} lies inside mount {mount}")]
    TargetInsideMount {
        service: String,
        target: PathBuf,
        mount: PathBuf,
    },

    #[error("services {first:?} and {second:?} share mount {mount}")]
    DuplicateMount {
        first: String,
        second: String,
        mount: PathBuf,
    },

    #[error("services {first:?} and {second:?} share bind target {target}")]
    DuplicateTarget {
        first: String,
        second: String,
        target: PathBuf,
    },

    #[error("service {service:?}: action {action:?}: {err}")]
    Action {
        service: String,
        action: String,
        #[source]
        err: ActionError,
    },
}

/// One bind-mount publication: `mount/service/source` appears read-only at
/// `target`.
#[derive(Debug, Clone, Deserialize)]
pub struct Dir {
    pub source: String,
    pub target: PathBuf,
    /// Octal file mode applied when the target directory is created.
    #[serde(default)]
    pub mode: Option<u32>,
}

/// The unit of reconciliation. A worker runs a service on this host iff
/// `machine` is in the host-identity set.
#[derive(Debug, Default, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub branch: String,
    /// Sub-directory of the repository to sparse-checkout.
    #[serde(default)]
    pub service: String,
    /// Private working copy root; the repository lives here and the sparse
    /// subtree appears at `mount/service`.
    #[serde(default)]
    pub mount: PathBuf,
    #[serde(default)]
    pub dirs: Vec<Dir>,
    /// OS package required before the first checkout.
    #[serde(default)]
    pub package: Option<String>,
    /// Unit-restart directive, `"<unit> <verb>"` with verb reload|restart.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,

    #[serde(skip)]
    pub status: ServiceState,
}

/// The Service-shaped template overlaid onto every concrete service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Global {
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub mount: PathBuf,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

/// Authorized public keys, consumed only by the control-plane front-end.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Keys {
    #[serde(default)]
    pub path: Vec<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub keys: Keys,
}

impl Config {
    pub fn parse(doc: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(doc)?)
    }
}

impl Service {
    /// Overlay the global template: explicit fields here win, the global
    /// fills the gaps. Idempotent.
    pub fn merge(mut self, global: &Global) -> Service {
        if self.upstream.is_empty() {
            self.upstream = global.upstream.clone();
        }
        if self.branch.is_empty() {
            self.branch = global.branch.clone();
        }
        if self.branch.is_empty() {
            self.branch = DEFAULT_BRANCH.to_string();
        }
        if self.mount.as_os_str().is_empty() {
            self.mount = global.mount.clone();
        }
        if self.user.is_none() {
            self.user = global.user.clone();
        }
        if self.group.is_none() {
            self.group = global.group.clone();
        }
        self
    }

    /// A worker is instantiated for this service iff its machine is one of
    /// the host's identities.
    pub fn for_me(&self, hosts: &[String]) -> bool {
        hosts.iter().any(|h| *h == self.machine)
    }

    /// The parsed unit-restart directive, if any. Callers run after
    /// [`validate`] so a parse failure here means "no action".
    pub fn parsed_action(&self) -> Option<Action> {
        self.action.as_deref().and_then(|a| a.parse().ok())
    }

    pub fn state(&self) -> (State, String) {
        self.status.state()
    }

    pub fn change(&self) -> chrono::DateTime<chrono::Utc> {
        self.status.change()
    }

    pub fn hash(&self) -> String {
        self.status.hash()
    }

    pub fn set_state(&self, state: State, info: impl Into<String>) {
        self.status.set_state(state, info);
        self.export();
    }

    pub fn set_hash(&self, hash: &str) {
        self.status.set_hash(hash);
        self.export();
    }

    fn export(&self) {
        let (state, _) = self.status.state();
        crate::metrics::service_info(&self.service, &self.status.hash(), state.as_str());
    }

    fn check(&self) -> Result<(), ConfigError> {
        let name = self.service.clone();
        for (field, value) in [
            ("machine", &self.machine),
            ("upstream", &self.upstream),
            ("service", &self.service),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingField {
                    service: name,
                    field,
                });
            }
        }
        if self.mount.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                service: name,
                field: "mount",
            });
        }
        if !self.mount.is_absolute() {
            return Err(ConfigError::MountNotAbsolute {
                service: name,
                mount: self.mount.clone(),
            });
        }
        if Path::new(&self.service).is_absolute() {
            return Err(ConfigError::SparseDirAbsolute {
                service: name,
                dir: self.service.clone(),
            });
        }
        for dir in &self.dirs {
            if !dir.target.is_absolute() {
                return Err(ConfigError::TargetNotAbsolute {
                    service: name,
                    target: dir.target.clone(),
                });
            }
            if dir.target.starts_with(&self.mount) {
                return Err(ConfigError::TargetInsideMount {
                    service: name,
                    target: dir.target.clone(),
                    mount: self.mount.clone(),
                });
            }
        }
        if let Some(action) = &self.action {
            action
                .parse::<Action>()
                .map_err(|err| ConfigError::Action {
                    service: name,
                    action: action.clone(),
                    err,
                })?;
        }
        Ok(())
    }
}

/// Check every merged service against the validity invariants: fields
/// populated, paths absolute/relative as required, and mounts and bind
/// targets disjoint across services. The mount-table invariant is guarded
/// here, at validation time, not at mount time.
pub fn validate(services: &[Service]) -> Result<(), ConfigError> {
    let mut mounts: HashMap<&Path, &str> = HashMap::new();
    let mut targets: HashMap<&Path, &str> = HashMap::new();
    for svc in services {
        svc.check()?;
        if let Some(first) = mounts.insert(&svc.mount, &svc.service) {
            return Err(ConfigError::DuplicateMount {
                first: first.to_string(),
                second: svc.service.clone(),
                mount: svc.mount.clone(),
            });
        }
        for dir in &svc.dirs {
            if let Some(first) = targets.insert(&dir.target, &svc.service) {
                return Err(ConfigError::DuplicateTarget {
                    first: first.to_string(),
                    second: svc.service.clone(),
                    target: dir.target.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> Global {
        Global {
            upstream: "https://example.org/repos/config.git".into(),
            branch: "main".into(),
            mount: PathBuf::from("/srv/shared"),
            user: Some("www-data".into()),
            group: None,
        }
    }

    fn service(name: &str) -> Service {
        Service {
            machine: "host-a".into(),
            service: name.into(),
            mount: PathBuf::from(format!("/srv/{name}")),
            ..Service::default()
        }
    }

    fn fields(s: &Service) -> (String, String, PathBuf, Option<String>, Option<String>) {
        (
            s.upstream.clone(),
            s.branch.clone(),
            s.mount.clone(),
            s.user.clone(),
            s.group.clone(),
        )
    }

    #[test]
    fn merge_fills_from_global() {
        let merged = service("app").merge(&global());
        assert_eq!(merged.upstream, "https://example.org/repos/config.git");
        assert_eq!(merged.branch, "main");
        assert_eq!(merged.mount, PathBuf::from("/srv/app"));
        assert_eq!(merged.user.as_deref(), Some("www-data"));
    }

    #[test]
    fn merge_explicit_fields_win() {
        let mut svc = service("app");
        svc.upstream = "https://example.org/repos/app.git".into();
        svc.branch = "stable".into();
        svc.user = Some("app".into());
        let merged = svc.merge(&global());
        assert_eq!(merged.upstream, "https://example.org/repos/app.git");
        assert_eq!(merged.branch, "stable");
        assert_eq!(merged.user.as_deref(), Some("app"));
    }

    #[test]
    fn merge_is_idempotent() {
        let g = global();
        let once = service("app").merge(&g);
        let first = fields(&once);
        let twice = once.merge(&g);
        assert_eq!(first, fields(&twice));
    }

    #[test]
    fn merge_defaults_branch() {
        let mut g = global();
        g.branch = String::new();
        let merged = service("app").merge(&g);
        assert_eq!(merged.branch, DEFAULT_BRANCH);
    }

    #[test]
    fn host_filter() {
        let svc = service("app");
        assert!(svc.for_me(&["host-a".into()]));
        assert!(svc.for_me(&["other".into(), "host-a".into()]));
        assert!(!svc.for_me(&["host-b".into()]));
        assert!(!svc.for_me(&[]));
    }

    #[test]
    fn parse_full_document() {
        let doc = r#"
[global]
upstream = "https://example.org/repos/config.git"
branch = "main"

[[services]]
machine = "host-a"
service = "etc/app"
mount = "/srv/app"
package = "app"
user = "app"
action = "app.service reload"

[[services.dirs]]
source = "conf"
target = "/etc/app.d"
mode = 0o755

[keys]
path = ["/etc/gitsyncd/ops.pub", "keys/extra.pub"]
"#;
        let cfg = Config::parse(doc).unwrap();
        assert_eq!(cfg.services.len(), 1);
        let merged: Vec<Service> = cfg
            .services
            .into_iter()
            .map(|s| s.merge(&cfg.global))
            .collect();
        validate(&merged).unwrap();
        let svc = &merged[0];
        assert_eq!(svc.upstream, "https://example.org/repos/config.git");
        assert_eq!(svc.dirs[0].mode, Some(0o755));
        assert_eq!(svc.dirs[0].target, PathBuf::from("/etc/app.d"));
        assert_eq!(cfg.keys.path.len(), 2);
        assert!(svc.parsed_action().is_some());
    }

    #[test]
    fn validate_rejects_relative_mount() {
        let mut svc = service("app");
        svc.upstream = "u".into();
        svc.mount = PathBuf::from("srv/app");
        assert!(matches!(
            validate(&[svc]),
            Err(ConfigError::MountNotAbsolute { .. })
        ));
    }

    #[test]
    fn validate_rejects_absolute_sparse_dir() {
        let mut svc = service("app");
        svc.upstream = "u".into();
        svc.service = "/etc/app".into();
        assert!(matches!(
            validate(&[svc]),
            Err(ConfigError::SparseDirAbsolute { .. })
        ));
    }

    #[test]
    fn validate_rejects_target_inside_mount() {
        let mut svc = service("app");
        svc.upstream = "u".into();
        svc.dirs = vec![Dir {
            source: "conf".into(),
            target: PathBuf::from("/srv/app/published"),
            mode: None,
        }];
        assert!(matches!(
            validate(&[svc]),
            Err(ConfigError::TargetInsideMount { .. })
        ));
    }

    #[test]
    fn validate_rejects_shared_mount() {
        let mut a = service("a");
        a.upstream = "u".into();
        let mut b = service("b");
        b.upstream = "u".into();
        b.mount = a.mount.clone();
        assert!(matches!(
            validate(&[a, b]),
            Err(ConfigError::DuplicateMount { .. })
        ));
    }

    #[test]
    fn validate_rejects_shared_target() {
        let target = PathBuf::from("/etc/app.d");
        let mut a = service("a");
        a.upstream = "u".into();
        a.dirs = vec![Dir {
            source: "conf".into(),
            target: target.clone(),
            mode: None,
        }];
        let mut b = service("b");
        b.upstream = "u".into();
        b.dirs = vec![Dir {
            source: "conf".into(),
            target,
            mode: None,
        }];
        assert!(matches!(
            validate(&[a, b]),
            Err(ConfigError::DuplicateTarget { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_action() {
        let mut svc = service("app");
        svc.upstream = "u".into();
        svc.action = Some("app.service explode".into());
        assert!(matches!(validate(&[svc]), Err(ConfigError::Action { .. })));
    }

    #[test]
    fn validate_rejects_missing_machine() {
        let mut svc = service("app");
        svc.upstream = "u".into();
        svc.machine = String::new();
        assert!(matches!(
            validate(&[svc]),
            Err(ConfigError::MissingField { field: "machine", .. })
        ));
    }
}
