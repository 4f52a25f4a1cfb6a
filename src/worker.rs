//! Per-service reconciliation worker
//!
//! One long-lived task per service. Every tick executes a single
//! reconciliation step governed by the state observed at the top of the
//! tick; operator mutations therefore land at tick boundaries and never
//! interleave with an in-flight pull. Errors are absorbed into the service
//! state, never propagated.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Service;
use crate::git::GitCmd;
use crate::mount::Mounter;
use crate::state::State;
use crate::unit::{Action, UnitDriver};

/// Default reconcile period.
pub const DEFAULT_TICK: Duration = Duration::from_secs(5 * 60);

/// Lower bound on the tick period, bounding fleet-wide load on the origin.
pub const MIN_TICK: Duration = Duration::from_secs(5);

pub struct Worker {
    service: Arc<Service>,
    git: GitCmd,
    mounter: Arc<dyn Mounter>,
    units: Arc<dyn UnitDriver>,
    action: Option<Action>,
    tick: Duration,
}

impl Worker {
    pub fn new(
        service: Arc<Service>,
        mounter: Arc<dyn Mounter>,
        units: Arc<dyn UnitDriver>,
        tick: Duration,
    ) -> Worker {
        Worker {
            git: GitCmd::new(&service),
            action: service.parsed_action(),
            mounter,
            units,
            tick: tick.max(MIN_TICK),
            service,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Drive the reconcile loop until cancelled. In-flight git operations
    /// run to completion; cancellation is honoured at tick boundaries and
    /// between the git and mount/unit steps.
    pub async fn run(self, token: CancellationToken) {
        log::info!(
            "Machine {:?}, tracking {:?} every {:?}",
            self.service.machine,
            self.service.upstream,
            self.tick
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("Machine {:?}, worker for {:?} stopping", self.service.machine, self.service.service);
                    return;
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
            self.reconcile(&token).await;
        }
    }

    /// One reconciliation step, governed by the current state.
    pub async fn reconcile(&self, token: &CancellationToken) {
        let (state, info) = self.service.state();
        match state {
            State::Freeze => {}
            State::Ok => self.tick_ok(token).await,
            State::Rollback => self.tick_rollback(&info, token).await,
            State::Broken => self.tick_broken(token).await,
        }
    }

    async fn tick_ok(&self, token: &CancellationToken) {
        let pull = match self.git.pull().await {
            Ok(pull) => pull,
            Err(err) => {
                log::warn!(
                    "Machine {:?}, error pulling repo {:?}: {err}",
                    self.service.machine,
                    self.service.upstream
                );
                self.service.set_state(
                    State::Broken,
                    format!("error pulling {:?}: {err}", self.service.upstream),
                );
                return;
            }
        };
        if !pull.changed {
            if self.service.hash() != pull.hash {
                self.service.set_hash(&pull.hash);
            }
            return;
        }
        log::info!(
            "Machine {:?}, repository in {:?} updated to {}",
            self.service.machine,
            self.git.repo().display().to_string(),
            pull.hash
        );
        if token.is_cancelled() {
            return;
        }
        if !self.publish() {
            return;
        }
        self.kick_units().await;
        self.service.set_hash(&pull.hash);
    }

    async fn tick_rollback(&self, hash: &str, token: &CancellationToken) {
        log::info!(
            "Machine {:?}, rolling {:?} back to {:?}",
            self.service.machine,
            self.service.service,
            hash
        );
        if let Err(err) = self.git.rollback(hash).await {
            log::warn!(
                "Machine {:?}, error rolling back {:?}: {err}",
                self.service.machine,
                self.service.service
            );
            self.service
                .set_state(State::Broken, format!("error rolling back: {err}"));
            return;
        }
        if token.is_cancelled() {
            return;
        }
        if !self.publish() {
            return;
        }
        self.kick_units().await;
        self.service.set_hash(hash);
        // Freeze so a subsequent tick does not race forward again.
        self.service.set_state(State::Freeze, "");
    }

    async fn tick_broken(&self, token: &CancellationToken) {
        if let Err(err) = self.git.checkout().await {
            self.service.set_state(
                State::Broken,
                format!("error pulling {:?}: {err}", self.service.upstream),
            );
            return;
        }
        let pull = match self.git.pull().await {
            Ok(pull) => pull,
            Err(err) => {
                self.service.set_state(
                    State::Broken,
                    format!("error pulling {:?}: {err}", self.service.upstream),
                );
                return;
            }
        };
        if token.is_cancelled() {
            return;
        }
        let fresh = match self.mounter.publish(&self.service) {
            Ok(fresh) => fresh,
            Err(err) => {
                log::warn!(
                    "Machine {:?}, error setting up bind mounts for {:?}: {err}",
                    self.service.machine,
                    self.service.upstream
                );
                self.service
                    .set_state(State::Broken, format!("error setting up bind mounts: {err}"));
                return;
            }
        };
        if pull.changed || fresh > 0 {
            self.kick_units().await;
        }
        self.service.set_hash(&pull.hash);
        self.service.set_state(State::Ok, "");
        log::info!(
            "Machine {:?}, service {:?} recovered at {}",
            self.service.machine,
            self.service.service,
            pull.hash
        );
    }

    /// Re-assert the bind mounts; existing correct mounts are untouched, a
    /// stale one is re-bound. A failure moves the service to BROKEN and
    /// suppresses the unit restart.
    fn publish(&self) -> bool {
        match self.mounter.publish(&self.service) {
            Ok(_) => true,
            Err(err) => {
                log::warn!(
                    "Machine {:?}, error setting up bind mounts for {:?}: {err}",
                    self.service.machine,
                    self.service.upstream
                );
                self.service
                    .set_state(State::Broken, format!("error setting up bind mounts: {err}"));
                false
            }
        }
    }

    /// A unit failure is logged only; the next commit retries it.
    async fn kick_units(&self) {
        let Some(action) = &self.action else {
            return;
        };
        if let Err(err) = self.units.kick(action).await {
            log::warn!(
                "Machine {:?}, error running systemctl: {err}",
                self.service.machine
            );
        }
    }
}
