//! Command-line surface shared by the binaries.

use std::io::{self, BufRead};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::config::DEFAULT_PORT;

/// Console line that asks a server to shut down.
pub const SHUTDOWN_COMMAND: &str = "SHUTDOWN";

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a single weather replica", long_about = None)]
pub struct ReplicaArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Directory holding the ledger snapshots.
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a dispatcher in front of a group of replicas", long_about = None)]
pub struct DispatcherArgs {
    /// Port to listen on; replicas take the ports right above it.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of replicas to launch.
    #[arg(default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..))]
    pub replicas: u16,

    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish or fetch weather readings", long_about = None)]
pub struct StationCli {
    #[command(subcommand)]
    pub command: StationCommand,
}

#[derive(Subcommand, Debug)]
pub enum StationCommand {
    /// Upload a `key: value` weather file, once or on an interval.
    Publish(PublishArgs),
    /// Print the freshest reading of a station.
    Fetch(FetchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    /// Server to talk to, as `host:port` or `http://host:port`.
    #[arg(long, default_value = "127.0.0.1:4567", value_parser = parse_server)]
    pub server: SocketAddr,

    /// Weather file to upload.
    #[arg(long)]
    pub file: PathBuf,

    /// Seconds between uploads. Without it the file is uploaded once.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Seconds to wait before retrying a failed upload when uploading on an interval.
    #[arg(long, default_value_t = 15)]
    pub retry_delay: u64,
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    #[arg(long, default_value = "127.0.0.1:4567", value_parser = parse_server)]
    pub server: SocketAddr,

    /// Station id; any station when omitted.
    pub station: Option<String>,
}

/// Resolves `host:port`, tolerating an `http://` prefix and a trailing path.
pub fn parse_server(raw: &str) -> Result<SocketAddr, String> {
    let trimmed = raw.trim();
    let without_scheme = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority
        .to_socket_addrs()
        .map_err(|err| format!("cannot resolve {raw:?}: {err}"))?
        .next()
        .ok_or_else(|| format!("{raw:?} resolved to no address"))
}

pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Blocks until `SHUTDOWN` is typed on stdin.
///
/// If stdin closes first the call keeps blocking, so a server started
/// without a console only stops when the process is killed.
pub fn wait_for_shutdown_command() {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if line.trim().eq_ignore_ascii_case(SHUTDOWN_COMMAND) => return,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    info!("console closed, running until killed");
    loop {
        thread::park();
    }
}
