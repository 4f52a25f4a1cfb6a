//! Per-service state machine
//!
//! ```text
//!        pull error            retry ok
//!   OK ────────────▶ BROKEN ────────────▶ OK
//!   OK ◀──unfreeze── FREEZE ◀──freeze──── OK
//!                    FREEZE ◀─────── ROLLBACK
//! ```
//!
//! The state is written by exactly two parties: the owning worker and the
//! control port. Out-of-band writes become visible to the worker at the top
//! of its next tick, never mid-tick.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Reconciliation state of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Tracking upstream; pull every tick.
    Ok,
    /// Pinned; no network I/O, no mutation.
    Freeze,
    /// A rollback to the hash carried in `info` is pending.
    Rollback,
    /// The last git or mount operation failed; retried every tick.
    Broken,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Freeze => "FREEZE",
            Self::Rollback => "ROLLBACK",
            Self::Broken => "BROKEN",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    info: String,
    change: DateTime<Utc>,
    hash: String,
}

/// Observable status of a service: (state, info, change-time, hash).
///
/// Every mutation stamps `change` with the current wall clock. All access
/// is serialized by the internal lock.
#[derive(Debug)]
pub struct ServiceState {
    inner: Mutex<Inner>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Ok,
                info: String::new(),
                change: Utc::now(),
                hash: String::new(),
            }),
        }
    }
}

impl ServiceState {
    pub fn state(&self) -> (State, String) {
        let inner = self.inner.lock().expect("state lock");
        (inner.state, inner.info.clone())
    }

    pub fn change(&self) -> DateTime<Utc> {
        self.inner.lock().expect("state lock").change
    }

    pub fn hash(&self) -> String {
        self.inner.lock().expect("state lock").hash.clone()
    }

    pub fn set_state(&self, state: State, info: impl Into<String>) {
        let mut inner = self.inner.lock().expect("state lock");
        inner.state = state;
        inner.info = info.into();
        inner.change = Utc::now();
    }

    pub fn set_hash(&self, hash: &str) {
        let mut inner = self.inner.lock().expect("state lock");
        inner.hash = hash.to_string();
        inner.change = Utc::now();
    }
}
