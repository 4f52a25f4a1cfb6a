//! Supervision
//!
//! Loads the config, optionally bootstraps it out of a repository, starts
//! one worker per service addressed to this host plus the control and
//! metrics listeners, then waits for a signal. Shutdown fans a single
//! cancellation token out to every task, awaits the workers, then the
//! listeners. A hangup returns a distinguished outcome so the host init
//! system can restart the process for a clean reload.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config, ConfigError, Keys, Service};
use crate::control::ControlPort;
use crate::git::{GitCmd, GitError};
use crate::metrics;
use crate::mount::{BindMounts, Mounter};
use crate::pkg::OsPkg;
use crate::state::State;
use crate::unit::{Systemctl, UnitDriver};
use crate::worker::Worker;

/// How often the config document is re-hashed when `-r` is given.
const WATCH_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("bind mounts require root")]
    NotRoot,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("bootstrap checkout of {upstream:?} failed: {err}")]
    Bootstrap {
        upstream: String,
        #[source]
        err: GitError,
    },

    #[error("reading public key {path}: {err}")]
    Keys {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("binding control listener on {addr}: {err}")]
    Bind {
        addr: String,
        #[source]
        err: std::io::Error,
    },

    #[error("installing metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("installing signal handler: {0}")]
    Signals(#[source] std::io::Error),
}

/// How the process should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    /// Hangup requested; exit 2 so the init system restarts us.
    Hangup,
}

/// Bootstrap group: clone the repository carrying our own config before
/// reading it.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub upstream: String,
    pub branch: String,
    pub dir: String,
    pub mount: PathBuf,
    pub pull: bool,
}

#[derive(Debug, Clone)]
pub struct Opts {
    pub config: PathBuf,
    /// Host identities; the OS hostname first, then impersonated aliases.
    pub hosts: Vec<String>,
    pub control_addr: String,
    pub metrics_addr: SocketAddr,
    pub restart: bool,
    pub tick: Duration,
    pub bootstrap: Option<Bootstrap>,
}

pub async fn run(opts: Opts) -> Result<Outcome, FatalError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(FatalError::NotRoot);
    }

    let hostname = opts.hosts.first().cloned().unwrap_or_default();
    let boot = opts.bootstrap.as_ref().map(|b| self_service(b, &hostname));
    let mut config_path = opts.config.clone();
    if let (Some(b), Some(svc)) = (&opts.bootstrap, &boot) {
        log::info!(
            "Bootstrapping from repo {:?}, adding service {:?} for {:?}",
            svc.upstream,
            svc.service,
            svc.machine
        );
        let git = GitCmd::new(svc);
        let fatal = |err| FatalError::Bootstrap {
            upstream: b.upstream.clone(),
            err,
        };
        git.checkout().await.map_err(fatal)?;
        if b.pull {
            git.pull().await.map_err(fatal)?;
        }
        config_path = svc.mount.join(&svc.service).join(&opts.config);
        log::info!("Using config {}", config_path.display());
    }

    let doc = std::fs::read_to_string(&config_path).map_err(|err| ConfigError::Read {
        path: config_path.clone(),
        err,
    })?;
    let Config {
        global,
        services,
        keys,
    } = Config::parse(&doc)?;
    let mut merged: Vec<Service> = services.into_iter().map(|s| s.merge(&global)).collect();
    if let Some(svc) = boot {
        merged.push(svc);
    }
    config::validate(&merged)?;
    let key_material = load_keys(&keys, opts.bootstrap.as_ref())?;

    metrics::install(opts.metrics_addr)?;
    let listener = TcpListener::bind(&opts.control_addr)
        .await
        .map_err(|err| FatalError::Bind {
            addr: opts.control_addr.clone(),
            err,
        })?;
    log::info!(
        "Launched control on {} and metrics on {} for machines {:?}, {} public keys loaded",
        opts.control_addr,
        opts.metrics_addr,
        opts.hosts,
        key_material.len()
    );

    let services: Arc<Vec<Arc<Service>>> = Arc::new(merged.into_iter().map(Arc::new).collect());
    let token = CancellationToken::new();
    let control = Arc::new(ControlPort::new(
        Arc::clone(&services),
        opts.hosts.clone(),
        key_material,
    ));
    let control_task = tokio::spawn(Arc::clone(&control).serve(listener, token.child_token()));

    let mounter: Arc<dyn Mounter> = Arc::new(BindMounts);
    let units: Arc<dyn UnitDriver> = Arc::new(Systemctl);
    let ospkg = OsPkg::detect();

    let mut workers = Vec::new();
    for svc in services.iter().filter(|s| s.for_me(&opts.hosts)) {
        start_service(svc, &ospkg, mounter.as_ref(), units.as_ref()).await;
        let worker = Worker::new(
            Arc::clone(svc),
            Arc::clone(&mounter),
            Arc::clone(&units),
            opts.tick,
        );
        workers.push(tokio::spawn(worker.run(token.child_token())));
    }
    if workers.is_empty() {
        log::warn!("No services found for machines {:?}, exiting", opts.hosts);
        token.cancel();
        let _ = control_task.await;
        return Ok(Outcome::Clean);
    }

    let (hup_tx, mut hup_rx) = mpsc::channel::<()>(1);
    if opts.restart {
        tokio::spawn(watch_config(
            config_path.clone(),
            WATCH_PERIOD,
            hup_tx,
            token.child_token(),
        ));
    } else {
        drop(hup_tx);
    }

    let mut signals = Signals::new().map_err(FatalError::Signals)?;
    let hangup = tokio::select! {
        hup = signals.wait() => hup,
        Some(()) = hup_rx.recv() => true,
    };
    log::info!("Shutting down{}", if hangup { " for restart" } else { "" });
    token.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    let _ = control_task.await;
    if !hangup {
        // A hangup restart republishes into the same targets; only a clean
        // exit unwinds the publications.
        for svc in services.iter().filter(|s| s.for_me(&opts.hosts)) {
            mounter.unmount(svc);
        }
    }
    Ok(if hangup { Outcome::Hangup } else { Outcome::Clean })
}

/// The synthesized service that reconciles the repository holding our own
/// config. It is appended to the configured services and treated like any
/// other.
fn self_service(boot: &Bootstrap, host: &str) -> Service {
    Service {
        machine: host.to_string(),
        upstream: boot.upstream.clone(),
        branch: boot.branch.clone(),
        mount: boot.mount.clone(),
        service: boot.dir.clone(),
        ..Service::default()
    }
}

/// Initial per-service startup: package, checkout, publication, first unit
/// kick. Any failure marks this one service broken and startup continues;
/// the worker retries from BROKEN on its next tick.
async fn start_service(
    svc: &Arc<Service>,
    ospkg: &OsPkg,
    mounter: &dyn Mounter,
    units: &dyn UnitDriver,
) {
    log::info!("Machine {:?} {:?}", svc.machine, svc.upstream);
    if let Some(pkg) = &svc.package {
        if let Err(err) = ospkg.install(pkg).await {
            log::warn!(
                "Machine {:?}, error installing package {:?}: {err}",
                svc.machine,
                pkg
            );
            svc.set_state(State::Broken, format!("error installing {pkg:?}: {err}"));
            return;
        }
    }
    let git = GitCmd::new(svc);
    if let Err(err) = git.checkout().await {
        log::warn!(
            "Machine {:?}, error pulling repo {:?}: {err}",
            svc.machine,
            svc.upstream
        );
        svc.set_state(
            State::Broken,
            format!("error pulling {:?}: {err}", svc.upstream),
        );
        return;
    }
    svc.set_hash(&git.hash().await);
    log::info!(
        "Machine {:?}, repository in {:?} with {:?}",
        svc.machine,
        git.repo().display().to_string(),
        svc.hash()
    );
    let mounts = match mounter.publish(svc) {
        Ok(mounts) => mounts,
        Err(err) => {
            log::warn!(
                "Machine {:?}, error setting up bind mounts for {:?}: {err}",
                svc.machine,
                svc.upstream
            );
            svc.set_state(
                State::Broken,
                format!("error setting up bind mounts: {err}"),
            );
            return;
        }
    };
    // Units see new files in their bind mounts; kick them here because
    // there may never be a newer commit to trigger it later.
    if mounts > 0 {
        if let Some(action) = svc.parsed_action() {
            if let Err(err) = units.kick(&action).await {
                log::warn!("Machine {:?}, error running systemctl: {err}", svc.machine);
            }
        }
    }
}

/// Read every authorized key file for the control-plane front-end; during
/// bootstrap, relative paths are rooted in the checked-out tree.
fn load_keys(keys: &Keys, boot: Option<&Bootstrap>) -> Result<Vec<String>, FatalError> {
    let mut material = Vec::with_capacity(keys.path.len());
    for path in &keys.path {
        let path = match boot {
            Some(b) if path.is_relative() => b.mount.join(&b.dir).join(path),
            _ => path.clone(),
        };
        log::info!("Reading public key {}", path.display());
        let key = std::fs::read_to_string(&path)
            .map_err(|err| FatalError::Keys { path, err })?;
        material.push(key.trim().to_string());
    }
    Ok(material)
}

/// Re-hash the config document every `period`; on a content change request
/// the hangup path so the init system restarts us with the new config.
/// Returns after reporting one change, or on cancellation.
pub async fn watch_config(
    path: PathBuf,
    period: Duration,
    tx: mpsc::Sender<()>,
    token: CancellationToken,
) {
    let mut last: Option<Vec<u8>> = None;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                log::debug!("reading config {}: {err}", path.display());
                continue;
            }
        };
        let digest = Sha256::digest(&bytes).to_vec();
        match &last {
            None => last = Some(digest),
            Some(prev) if *prev != digest => {
                log::info!("Config {} changed, requesting restart", path.display());
                let _ = tx.send(()).await;
                return;
            }
            _ => {}
        }
    }
}

/// The signals the supervisor answers to.
struct Signals {
    int: Signal,
    term: Signal,
    hup: Signal,
}

impl Signals {
    fn new() -> std::io::Result<Signals> {
        Ok(Signals {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal; true means a restart was requested.
    async fn wait(&mut self) -> bool {
        tokio::select! {
            _ = self.int.recv() => false,
            _ = self.term.recv() => false,
            _ = self.hup.recv() => true,
        }
    }
}
