//! Metrics exposition
//!
//! A single gauge `gitsyncd_service_info{service,hash,state}` with value 1
//! per observed tuple, served by the Prometheus exporter on the metrics
//! address. Tuples for superseded hashes and states persist until process
//! restart.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Gauge carrying the current hash and state for each service.
pub const SERVICE_INFO: &str = "gitsyncd_service_info";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global recorder and start the HTTP exposition listener.
/// Safe to call more than once; only the first call listens.
pub fn install(addr: SocketAddr) -> Result<(), BuildError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_gauge!(SERVICE_INFO, "Current hash and state for this service");
    let _ = INSTALLED.set(());
    Ok(())
}

/// Record the observed (service, hash, state) tuple. A no-op until the
/// recorder is installed, which keeps tests quiet.
pub fn service_info(service: &str, hash: &str, state: &str) {
    gauge!(
        SERVICE_INFO,
        "service" => service.to_string(),
        "hash" => hash.to_string(),
        "state" => state.to_string()
    )
    .set(1.0);
}
