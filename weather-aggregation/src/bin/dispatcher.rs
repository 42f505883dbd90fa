//! Runs a dispatcher and the replicas behind it in one process.
//!
//! ```bash
//! # dispatcher on 4567, replicas on 4568..=4570
//! cargo run --bin dispatcher -- 4567 3
//! ```
//!
//! Type `SHUTDOWN` on the console to stop everything.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use weather_aggregation::cli::{DispatcherArgs, init_tracing, wait_for_shutdown_command};
use weather_aggregation::config::StoreConfig;
use weather_aggregation::dispatcher::Dispatcher;

fn main() -> Result<()> {
    init_tracing();
    let args = DispatcherArgs::parse();

    let dispatcher = Dispatcher::launch(
        SocketAddr::new(args.host, args.port),
        usize::from(args.replicas),
        StoreConfig::new(&args.data_dir),
    )?;
    info!(
        "dispatcher listening on {} with replicas {:?}",
        dispatcher.local_addr(),
        dispatcher.servers()
    );

    wait_for_shutdown_command();
    dispatcher.shutdown();
    Ok(())
}
