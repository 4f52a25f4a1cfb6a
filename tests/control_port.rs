//! Control port routing and the TCP listener end-to-end.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use gitsyncd::config::Service;
use gitsyncd::control::ControlPort;
use gitsyncd::protocol::{ListMachines, ListServices, Reply};
use gitsyncd::state::State;

const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

fn port() -> (ControlPort, Arc<Vec<Arc<Service>>>) {
    let mut local = common::service("git://x/r.git", PathBuf::from("/srv/app"), "etc/app", vec![]);
    local.machine = "host-a".into();
    let mut remote =
        common::service("git://x/r.git", PathBuf::from("/srv/other"), "etc/other", vec![]);
    remote.machine = "host-b".into();
    let services: Arc<Vec<Arc<Service>>> = Arc::new(vec![Arc::new(local), Arc::new(remote)]);
    (
        ControlPort::new(services.clone(), vec!["host-a".into()], vec![]),
        services,
    )
}

#[test]
fn list_machines_covers_every_configured_service() {
    let (port, _) = port();
    let reply = port.dispatch("/list/machine");
    assert_eq!(reply.code, 200);
    let lm: ListMachines = serde_json::from_str(&reply.body).unwrap();
    assert_eq!(lm.machines.len(), 2);
    assert!(lm.machines.iter().all(|m| m.actual == "host-a"));
    assert_eq!(lm.machines[0].machine, "host-a");
    assert_eq!(lm.machines[1].machine, "host-b");
}

#[test]
fn list_services_is_scoped_to_this_host() {
    let (port, services) = port();
    services[0].set_hash(HASH);

    let reply = port.dispatch("/list/service");
    assert_eq!(reply.code, 200);
    let ls: ListServices = serde_json::from_str(&reply.body).unwrap();
    assert_eq!(ls.services.len(), 1);
    assert_eq!(ls.services[0].service, "etc/app");
    assert_eq!(ls.services[0].hash, HASH);
    assert_eq!(ls.services[0].state, "OK");

    let reply = port.dispatch("/list/service etc/app");
    let ls: ListServices = serde_json::from_str(&reply.body).unwrap();
    assert_eq!(ls.services.len(), 1);

    // A service bound to another machine is not addressable here.
    assert_eq!(port.dispatch("/list/service etc/other").code, 404);
    assert_eq!(port.dispatch("/list/service nope").code, 404);
}

#[test]
fn freeze_and_unfreeze_are_idempotent() {
    let (port, services) = port();

    assert_eq!(port.dispatch("/state/freeze etc/app").code, 200);
    assert_eq!(services[0].state(), (State::Freeze, String::new()));
    assert_eq!(port.dispatch("/state/freeze etc/app").code, 200);
    assert_eq!(services[0].state().0, State::Freeze);

    assert_eq!(port.dispatch("/state/unfreeze etc/app").code, 200);
    assert_eq!(services[0].state(), (State::Ok, String::new()));

    assert_eq!(port.dispatch("/state/freeze").code, 406);
    assert_eq!(port.dispatch("/state/freeze nope").code, 404);
    assert_eq!(port.dispatch("/state/freeze etc/other").code, 404);
}

#[test]
fn rollback_validates_the_hash_before_any_state_change() {
    let (port, services) = port();

    let reply = port.dispatch("/state/rollback etc/app xyz");
    assert_eq!(reply.code, 406);
    assert!(reply.body.contains("not a valid git hash"), "{}", reply.body);
    assert_eq!(services[0].state().0, State::Ok);

    assert_eq!(port.dispatch("/state/rollback etc/app").code, 406);
    assert_eq!(services[0].state().0, State::Ok);

    let reply = port.dispatch(&format!("/state/rollback etc/app {HASH}"));
    assert_eq!(reply.code, 200);
    assert_eq!(services[0].state(), (State::Rollback, HASH.to_string()));

    assert_eq!(port.dispatch(&format!("/state/rollback nope {HASH}")).code, 404);
}

#[test]
fn keys_are_held_for_the_front_end_authenticator() {
    let services: Arc<Vec<Arc<Service>>> = Arc::new(vec![]);
    let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFo ops@example.org".to_string();
    let port = ControlPort::new(services, vec!["host-a".into()], vec![key.clone()]);
    assert_eq!(port.authorized_keys(), [key]);
}

#[test]
fn unknown_routes_and_blank_lines() {
    let (port, _) = port();
    assert_eq!(port.dispatch("/state/explode etc/app").code, 404);
    assert_eq!(port.dispatch("").code, 400);
    assert_eq!(port.dispatch("  \t ").code, 400);
}

#[tokio::test]
async fn serves_one_command_per_connection() {
    let (port, _) = port();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let task = tokio::spawn(Arc::new(port).serve(listener, token.clone()));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"/list/machine\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let reply = Reply::parse(&response).unwrap();
    assert_eq!(reply.code, 200);
    let lm: ListMachines = serde_json::from_str(&reply.body).unwrap();
    assert_eq!(lm.machines.len(), 2);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("listener stops")
        .expect("listener task");
}
