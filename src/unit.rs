//! Unit restarts
//!
//! When a service's files change, its `action` directive names an
//! init-system unit to kick. The capability is behind [`UnitDriver`] so
//! workers can be exercised without a running init system.

use std::process::Stdio;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("expected \"<unit> <verb>\"")]
    Malformed,
    #[error("unknown verb {0:?}, expected reload or restart")]
    UnknownVerb(String),
}

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("systemctl {verb} {unit} failed: {stderr}")]
    Systemctl {
        unit: String,
        verb: &'static str,
        stderr: String,
    },

    #[error("spawning systemctl: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Reload,
    Restart,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reload => "reload",
            Self::Restart => "restart",
        }
    }
}

/// A parsed `action` directive: `"<unit> <verb>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub unit: String,
    pub verb: Verb,
}

impl FromStr for Action {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(unit), Some(verb), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ActionError::Malformed);
        };
        let verb = match verb {
            "reload" => Verb::Reload,
            "restart" => Verb::Restart,
            other => return Err(ActionError::UnknownVerb(other.to_string())),
        };
        Ok(Action {
            unit: unit.to_string(),
            verb,
        })
    }
}

/// Abstract "kick this named unit" capability.
#[async_trait]
pub trait UnitDriver: Send + Sync {
    async fn kick(&self, action: &Action) -> Result<(), UnitError>;
}

/// The real thing: shells out to `systemctl`.
pub struct Systemctl;

#[async_trait]
impl UnitDriver for Systemctl {
    async fn kick(&self, action: &Action) -> Result<(), UnitError> {
        log::debug!("running systemctl {} {}", action.verb.as_str(), action.unit);
        let out = Command::new("systemctl")
            .arg(action.verb.as_str())
            .arg(&action.unit)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(UnitError::Systemctl {
                unit: action.unit.clone(),
                verb: action.verb.as_str(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
