//! Weather station and reader client.
//!
//! ```bash
//! # upload a reading every 10 seconds
//! cargo run --bin station -- publish --server 127.0.0.1:4567 --file weather.txt --interval 10
//!
//! # print the freshest reading of a station
//! cargo run --bin station -- fetch --server 127.0.0.1:4567 IDS60901
//! ```

use std::fs;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use weather_aggregation::cli::{FetchArgs, PublishArgs, StationCli, StationCommand, init_tracing};
use weather_aggregation::client::{StationClient, parse_text_payload, render_text_payload};
use weather_aggregation::wire::Status;

fn main() -> Result<()> {
    init_tracing();
    let cli = StationCli::parse();
    match cli.command {
        StationCommand::Publish(args) => publish(args),
        StationCommand::Fetch(args) => fetch(args),
    }
}

fn publish(args: PublishArgs) -> Result<()> {
    let client = StationClient::new();
    info!(sender = %client.sender_id(), server = %args.server, "publishing {}", args.file.display());

    loop {
        let text = fs::read_to_string(&args.file)
            .with_context(|| format!("failed to read {}", args.file.display()))?;
        let payload = parse_text_payload(&text)?;

        let wait = match (client.publish(args.server, &payload), args.interval) {
            (Ok(response), interval) => {
                info!(status = %response.status, clock = client.clock().value(), "upload finished");
                match interval {
                    Some(interval) => interval,
                    None => return Ok(()),
                }
            }
            (Err(err), Some(_)) => {
                warn!(error = ?err, retry_in = args.retry_delay, "upload failed");
                args.retry_delay
            }
            (Err(err), None) => return Err(err),
        };
        thread::sleep(Duration::from_secs(wait));
    }
}

fn fetch(args: FetchArgs) -> Result<()> {
    let client = StationClient::new();
    let response = client.fetch(args.server, args.station.as_deref())?;
    match (response.status, response.body) {
        (Status::Ok, Some(body)) => print!("{}", render_text_payload(&body)),
        (status, _) => println!("{status}"),
    }
    Ok(())
}
