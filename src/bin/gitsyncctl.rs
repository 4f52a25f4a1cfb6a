//! gitsyncctl - Operator client for gitsyncd
//!
//! Sends one command per connection to the control port and prints the
//! reply. Exits non-zero when the daemon answers with an error status.

use std::process;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use gitsyncd::protocol::Reply;

#[derive(Parser)]
#[command(name = "gitsyncctl")]
#[command(about = "Control a running gitsyncd")]
struct Args {
    /// Address of the gitsyncd control port
    #[arg(short = 'a', long, default_value = "127.0.0.1:2222")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the machines of every configured service
    Machines,
    /// List services with hash, state and last change
    Services {
        /// Limit the listing to one service
        name: Option<String>,
    },
    /// Pin a service at its current commit
    Freeze {
        service: String,
    },
    /// Resume tracking upstream
    Unfreeze {
        service: String,
    },
    /// Pin a service to an older commit
    Rollback {
        service: String,
        hash: String,
    },
}

impl Command {
    fn wire(&self) -> String {
        match self {
            Command::Machines => "/list/machine".to_string(),
            Command::Services { name: None } => "/list/service".to_string(),
            Command::Services { name: Some(name) } => format!("/list/service {name}"),
            Command::Freeze { service } => format!("/state/freeze {service}"),
            Command::Unfreeze { service } => format!("/state/unfreeze {service}"),
            Command::Rollback { service, hash } => format!("/state/rollback {service} {hash}"),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let reply = match exchange(&args.addr, &args.command.wire()).await {
        Ok(reply) => reply,
        Err(err) => {
            eprintln!("gitsyncctl: {err}");
            process::exit(1);
        }
    };
    println!("{}", reply.body);
    if reply.code / 100 != 2 {
        process::exit(1);
    }
}

async fn exchange(addr: &str, command: &str) -> std::io::Result<Reply> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(command.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Reply::parse(&response).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed reply")
    })
}
