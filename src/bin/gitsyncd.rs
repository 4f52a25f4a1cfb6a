//! gitsyncd - Per-host GitOps agent daemon
//!
//! Reconciles the services declared in the config document, serves the
//! control port and the metrics endpoint, and exits 2 on SIGHUP so the
//! init system restarts it for a clean reload.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser};

use gitsyncd::supervisor::{self, Bootstrap, Opts, Outcome};
use gitsyncd::worker::DEFAULT_TICK;

#[derive(Parser)]
#[command(name = "gitsyncd")]
#[command(about = "Per-host GitOps agent")]
#[command(disable_help_flag = true)]
#[command(
    long_about = "gitsyncd keeps sparse git checkouts in sync with their upstreams, \
    publishes them through read-only bind mounts and restarts the units that \
    consume them. Operators drive it with gitsyncctl."
)]
struct Args {
    /// Config file to read
    #[arg(short = 'c', value_name = "FILE")]
    config: PathBuf,

    /// Control-plane address to listen on
    #[arg(short = 's', value_name = "ADDR", default_value = "127.0.0.1:2222")]
    control: String,

    /// Metrics address to listen on
    #[arg(short = 'm', value_name = "ADDR", default_value = "127.0.0.1:9222")]
    metrics: SocketAddr,

    /// Hosts (comma separated) to impersonate; the local hostname is
    /// always included
    #[arg(short = 'h', value_name = "HOST", value_delimiter = ',')]
    hosts: Vec<String>,

    /// Enable debug logging
    #[arg(short = 'd')]
    debug: bool,

    /// Exit (status 2) when the config document changes
    #[arg(short = 'r')]
    restart: bool,

    /// [bootstrapping] use this git repo
    #[arg(short = 'U', value_name = "URL")]
    upstream: Option<String>,

    /// [bootstrapping] check out this branch
    #[arg(short = 'B', value_name = "BRANCH", default_value = "main")]
    branch: String,

    /// [bootstrapping] directory to sparse checkout
    #[arg(short = 'D', value_name = "DIR", default_value = "gitsyncd")]
    dir: String,

    /// [bootstrapping] check out into this directory, -c is relative to it
    #[arg(short = 'M', value_name = "DIR")]
    mount: Option<PathBuf>,

    /// [bootstrapping] pull the repo to the newest version before starting
    #[arg(short = 'P')]
    pull: bool,

    /// Print help
    #[arg(long, action = ArgAction::HelpLong)]
    help: Option<bool>,
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut hosts = vec![hostname()];
    hosts.extend(args.hosts);

    let bootstrap = match (args.upstream, args.mount) {
        (Some(upstream), Some(mount)) => Some(Bootstrap {
            upstream,
            branch: args.branch,
            dir: args.dir,
            mount,
            pull: args.pull,
        }),
        (None, None) => None,
        _ => {
            log::error!("bootstrapping needs both -U and -M");
            process::exit(1);
        }
    };

    let opts = Opts {
        config: args.config,
        hosts,
        control_addr: args.control,
        metrics_addr: args.metrics,
        restart: args.restart,
        tick: DEFAULT_TICK,
        bootstrap,
    };

    match supervisor::run(opts).await {
        Ok(Outcome::Clean) => {}
        // Exit 2 so the init system restarts us (Restart=on-failure).
        Ok(Outcome::Hangup) => process::exit(2),
        Err(err) => {
            log::error!("{err}");
            process::exit(1);
        }
    }
}
