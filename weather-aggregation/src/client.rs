//! Blocking client used by weather stations and readers.

use std::io::BufReader;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use nanoid::nanoid;
use serde_json::{Map, Value};
use tracing::debug;

use crate::clock::{LamportClock, Timestamp};
use crate::transport::{TcpTransport, Transport};
use crate::wire::{self, Greeting, Request, Response, WireError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A content source or reader with its own Lamport clock.
///
/// Every exchange folds the server's preamble into the clock before the
/// request is stamped, and folds the response stamp in afterwards.
#[derive(Debug)]
pub struct StationClient {
    clock: LamportClock,
    sender_id: String,
}

impl Default for StationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StationClient {
    /// Creates a client with a random sender id.
    pub fn new() -> Self {
        Self::with_sender_id(nanoid!())
    }

    pub fn with_sender_id(sender_id: impl Into<String>) -> Self {
        Self {
            clock: LamportClock::new(),
            sender_id: sender_id.into(),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Uploads `payload` and returns the server's response.
    pub fn publish(&self, server: SocketAddr, payload: &Value) -> Result<Response> {
        self.exchange(server, |clock| Request::put(&self.sender_id, clock, payload))
    }

    /// Reads the freshest reading of `station`, or of any station.
    pub fn fetch(&self, server: SocketAddr, station: Option<&str>) -> Result<Response> {
        self.exchange(server, |clock| Ok(Request::get(station, clock)))
    }

    fn exchange<F>(&self, server: SocketAddr, build: F) -> Result<Response>
    where
        F: FnOnce(Timestamp) -> Result<Request, WireError>,
    {
        let connection = TcpTransport
            .connect_timeout(server, CONNECT_TIMEOUT)
            .with_context(|| format!("failed to connect to {server}"))?;
        connection.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut reader = BufReader::new(connection);

        match wire::read_greeting(&mut reader).context("failed to read server greeting")? {
            Greeting::Preamble(clock) => self.clock.receive(clock),
            Greeting::Rejected(response) => {
                debug!(%server, status = %response.status, "connection turned away");
                self.clock.receive(response.lamport_clock);
                return Ok(response);
            }
        }

        let request = build(self.clock.send())?;
        request
            .write_to(reader.get_mut())
            .with_context(|| format!("failed to send request to {server}"))?;

        let response = wire::read_response(&mut reader).context("failed to read response")?;
        self.clock.receive(response.lamport_clock);
        debug!(%server, status = %response.status, clock = self.clock.value(), "exchange complete");
        Ok(response)
    }
}

/// Parses a station's text file (one `key: value` per line) into a JSON object.
///
/// Blank lines are skipped. Values stay strings.
pub fn parse_text_payload(text: &str) -> Result<Value> {
    let mut fields = Map::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            bail!("line {} is not `key: value`: {line:?}", number + 1);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("line {} has an empty key", number + 1);
        }
        fields.insert(key.to_string(), Value::String(value.trim().to_string()));
    }
    Ok(Value::Object(fields))
}

/// Renders a reading back into `key: value` lines.
pub fn render_text_payload(payload: &Value) -> String {
    match payload {
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| match value {
                Value::String(text) => format!("{key}: {text}\n"),
                other => format!("{key}: {other}\n"),
            })
            .collect(),
        other => format!("{other}\n"),
    }
}
