//! The unit stored per station: one payload stamped with a logical time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Timestamp;

/// Payload field that names the station a reading belongs to.
pub const STATION_ID_FIELD: &str = "id";

/// One weather payload tagged with the logical time it was committed at and
/// the content source that sent it. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    payload: Value,
    logical_time: Timestamp,
    source_id: String,
}

impl Reading {
    pub fn new(payload: Value, logical_time: Timestamp, source_id: impl Into<String>) -> Self {
        Self {
            payload,
            logical_time,
            source_id: source_id.into(),
        }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn logical_time(&self) -> Timestamp {
        self.logical_time
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

/// Extracts a non-empty station id from a payload's `"id"` field.
///
/// Strings are taken as-is (trimmed); numbers are rendered to text.
pub fn station_id_of(payload: &Value) -> Option<String> {
    let id = match payload.get(STATION_ID_FIELD)? {
        Value::String(id) => id.trim().to_string(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

/// Picks the reading with the largest logical time that is not newer than
/// `visible_at`. Ties keep the reading inserted first.
pub fn freshest_visible(ledger: &[Reading], visible_at: Timestamp) -> Option<&Reading> {
    ledger
        .iter()
        .filter(|reading| reading.logical_time <= visible_at)
        .fold(None, |best: Option<&Reading>, reading| match best {
            Some(best) if best.logical_time >= reading.logical_time => Some(best),
            _ => Some(reading),
        })
}
