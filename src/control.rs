//! Control port
//!
//! Read/mutate access to service state from the outside: list, freeze,
//! unfreeze, rollback. One command per TCP connection; authentication is
//! the front-end's job, the port assumes already-authenticated callers.
//! Mutations only take effect in the owning worker at its next tick.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Service;
use crate::git;
use crate::protocol::{
    self, parse_command, ListMachine, ListMachines, ListService, ListServices, Reply,
};
use crate::state::State;

/// Longest command line accepted from a client.
const MAX_COMMAND: u64 = 4096;

pub struct ControlPort {
    services: Arc<Vec<Arc<Service>>>,
    hosts: Vec<String>,
    /// Authorized key material for the front-end authenticator.
    keys: Vec<String>,
}

impl ControlPort {
    pub fn new(services: Arc<Vec<Arc<Service>>>, hosts: Vec<String>, keys: Vec<String>) -> Self {
        Self {
            services,
            hosts,
            keys,
        }
    }

    pub fn authorized_keys(&self) -> &[String] {
        &self.keys
    }

    /// Route a command line to its handler. Unknown routes are 404, a
    /// blank line is 400.
    pub fn dispatch(&self, line: &str) -> Reply {
        let Some(cmd) = parse_command(line) else {
            return Reply::status(protocol::BAD_REQUEST);
        };
        if cmd.route.starts_with("/list/machine") {
            self.list_machines()
        } else if cmd.route.starts_with("/list/service") {
            self.list_services(cmd.arg(0))
        } else if cmd.route.starts_with("/state/freeze") {
            self.set_state(cmd.arg(0), State::Freeze)
        } else if cmd.route.starts_with("/state/unfreeze") {
            self.set_state(cmd.arg(0), State::Ok)
        } else if cmd.route.starts_with("/state/rollback") {
            self.rollback(cmd.arg(0), cmd.arg(1))
        } else {
            Reply::status(protocol::NOT_FOUND)
        }
    }

    /// Services addressable from this host.
    fn local(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.iter().filter(|s| s.for_me(&self.hosts))
    }

    fn find(&self, name: &str) -> Option<&Arc<Service>> {
        self.local().find(|s| s.service == name)
    }

    fn list_machines(&self) -> Reply {
        let actual = self.hosts.first().cloned().unwrap_or_default();
        let lm = ListMachines {
            machines: self
                .services
                .iter()
                .map(|s| ListMachine {
                    machine: s.machine.clone(),
                    actual: actual.clone(),
                })
                .collect(),
        };
        json(&lm)
    }

    fn list_services(&self, name: Option<&str>) -> Reply {
        let ls = ListServices {
            services: self
                .local()
                .filter(|s| name.is_none() || name == Some(s.service.as_str()))
                .map(|s| {
                    let (state, info) = s.state();
                    ListService {
                        service: s.service.clone(),
                        hash: s.hash(),
                        state: state.to_string(),
                        info,
                        change: s.change().to_rfc2822(),
                    }
                })
                .collect(),
        };
        if ls.services.is_empty() {
            return Reply::status(protocol::NOT_FOUND);
        }
        json(&ls)
    }

    fn set_state(&self, name: Option<&str>, state: State) -> Reply {
        let Some(name) = name else {
            return Reply::status(protocol::NOT_ACCEPTABLE);
        };
        let Some(service) = self.find(name) else {
            return Reply::status(protocol::NOT_FOUND);
        };
        service.set_state(state, "");
        log::info!(
            "Machine {:?}, service {:?} set to {state}",
            service.machine,
            service.service
        );
        Reply::status(protocol::OK)
    }

    fn rollback(&self, name: Option<&str>, hash: Option<&str>) -> Reply {
        let (Some(name), Some(hash)) = (name, hash) else {
            return Reply::status(protocol::NOT_ACCEPTABLE);
        };
        if !git::is_hash(hash) {
            return Reply::status_with(
                protocol::NOT_ACCEPTABLE,
                format!("not a valid git hash: {hash}"),
            );
        }
        let Some(service) = self.find(name) else {
            return Reply::status(protocol::NOT_FOUND);
        };
        service.set_state(State::Rollback, hash);
        log::info!(
            "Machine {:?}, service {:?} set to {}",
            service.machine,
            service.service,
            State::Rollback
        );
        Reply::status(protocol::OK)
    }

    /// Accept loop. Stops accepting on cancellation, then awaits in-flight
    /// handlers.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::debug!("control connection from {peer}");
                            let port = Arc::clone(&self);
                            tracker.spawn(async move { port.handle(stream).await });
                        }
                        Err(err) => log::warn!("control accept: {err}"),
                    }
                }
            }
        }
        tracker.close();
        tracker.wait().await;
        log::info!("control listener stopped");
    }

    async fn handle(&self, stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if let Err(err) = (&mut reader).take(MAX_COMMAND).read_line(&mut line).await {
            log::warn!("control read: {err}");
            return;
        }
        let reply = self.dispatch(&line);
        let mut stream = reader.into_inner();
        if let Err(err) = stream.write_all(reply.render().as_bytes()).await {
            log::warn!("control write: {err}");
        }
        let _ = stream.shutdown().await;
    }
}

fn json<T: serde::Serialize>(value: &T) -> Reply {
    match serde_json::to_string(value) {
        Ok(body) => Reply::ok(body),
        Err(err) => {
            log::warn!("marshalling control reply: {err}");
            Reply::status(protocol::INTERNAL)
        }
    }
}
