//! gitsyncd - Per-host GitOps agent
//!
//! Continuously reconciles local directories with branches of remote Git
//! repositories and, when file contents change, restarts the units that
//! consume them. Working copies are sparse checkouts published through
//! read-only bind mounts; operators can freeze services or pin them to an
//! older commit through the control port.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      gitsyncd                        │
//! ├──────────────────────────────────────────────────────┤
//! │  Supervisor  │  ServiceWorker (1/service) │ Control  │
//! ├──────────────────────────────────────────────────────┤
//! │   GitCmd     │   BindMounts   │  Systemctl │ OsPkg   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod git;
pub mod metrics;
pub mod mount;
pub mod pkg;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod unit;
pub mod worker;

pub use config::{Config, Dir, Global, Service};
pub use state::State;
