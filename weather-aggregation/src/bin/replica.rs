//! Runs one replica with its own store.
//!
//! ```bash
//! cargo run --bin replica -- 4567 --data-dir data
//! ```
//!
//! Type `SHUTDOWN` on the console to flush the store and exit.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use weather_aggregation::cli::{ReplicaArgs, init_tracing, wait_for_shutdown_command};
use weather_aggregation::config::{ReplicaConfig, StoreConfig};
use weather_aggregation::deployment::Deployment;
use weather_aggregation::replica::Replica;

fn main() -> Result<()> {
    init_tracing();
    let args = ReplicaArgs::parse();

    let deployment = Deployment::open(StoreConfig::new(&args.data_dir))?;
    let replica = Replica::start(
        ReplicaConfig::new(SocketAddr::new(args.host, args.port)),
        &deployment,
    )?;
    info!("replica listening on {}", replica.local_addr());

    wait_for_shutdown_command();
    replica.shutdown();
    Ok(())
}
