//! Line-oriented request/response framing.
//!
//! Borrowed from HTTP/1.1 but far smaller: a start line, `Key: Value`
//! headers terminated by a blank line, and an optional body whose size is
//! given by `Content-Length`. Lines end in CRLF; bare LF is accepted on read.
//!
//! ```text
//! PUT /weather.json HTTP/1.1
//! SenderID: 2f8c...
//! LamportClock: 12
//! Content-Type: application/json
//! Content-Length: 42
//!
//! {"id": "IDS60901", "air_temp": 13.3}
//! ```
//!
//! Before a replica reads a request it sends a one-line preamble
//! (`LamportClock: <n>`) so the client can fold the replica's clock into its
//! own before stamping the request.

use std::fmt;
use std::io::{self, BufRead, Read, Write};

use serde_json::Value;
use thiserror::Error;

use crate::clock::{MAX_TIMESTAMP, Timestamp};

pub const LAMPORT_CLOCK: &str = "LamportClock";
pub const STATION_ID: &str = "StationID";
pub const SENDER_ID: &str = "SenderID";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";

pub const PROTOCOL_VERSION: &str = "HTTP/1.1";
pub const WEATHER_PATH: &str = "/weather.json";

/// Clock value sent by peers that have no clock of their own.
pub const NO_CLOCK: Timestamp = -1;

const MAX_BODY_BYTES: usize = 1 << 20;
const MAX_LINE_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("header {name} is not an integer: {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("clock {0} is outside {min}..={max}", min = NO_CLOCK, max = MAX_TIMESTAMP)]
    ClockOutOfRange(Timestamp),
    #[error("line exceeds {max} bytes", max = MAX_LINE_BYTES)]
    LineTooLong,
    #[error("more than {max} headers", max = MAX_HEADERS)]
    TooManyHeaders,
    #[error("line is not valid utf-8")]
    InvalidUtf8,
    #[error("body of {0} bytes exceeds the limit")]
    BodyTooLarge(usize),
    #[error("unknown status code {0}")]
    UnknownStatus(u16),
    #[error("body is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl WireError {
    /// `true` when the peer sent something we refuse to parse, as opposed to
    /// the connection failing underneath us.
    pub fn is_malformed(&self) -> bool {
        match self {
            WireError::Io(err) => err.kind() == io::ErrorKind::InvalidData,
            WireError::UnexpectedEof => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Other(String),
}

impl Method {
    fn parse(verb: &str) -> Self {
        if verb.eq_ignore_ascii_case("GET") {
            Method::Get
        } else if verb.eq_ignore_ascii_case("PUT") {
            Method::Put
        } else {
            Method::Other(verb.to_string())
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Put => f.write_str("PUT"),
            Method::Other(verb) => f.write_str(verb),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            path: WEATHER_PATH.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Read request for `station` (or any station), stamped with `clock`.
    pub fn get(station: Option<&str>, clock: Timestamp) -> Self {
        let mut request = Self::new(Method::Get).with_header(LAMPORT_CLOCK, clock.to_string());
        if let Some(station) = station {
            request = request.with_header(STATION_ID, station);
        }
        request
    }

    /// Write request carrying `payload` from `sender`, stamped with `clock`.
    pub fn put(sender: &str, clock: Timestamp, payload: &Value) -> Result<Self, WireError> {
        let body = serde_json::to_string_pretty(payload)?;
        Ok(Self::new(Method::Put)
            .with_header(SENDER_ID, sender)
            .with_header(LAMPORT_CLOCK, clock.to_string())
            .with_header(CONTENT_TYPE, "application/json")
            .with_header(CONTENT_LENGTH, body.len().to_string())
            .with_body(body))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of `name` (case-insensitive); blank values count as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The sender's declared clock, or [`NO_CLOCK`] when it sent none.
    pub fn lamport_clock(&self) -> Result<Timestamp, WireError> {
        parse_clock(self.header(LAMPORT_CLOCK))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut out = format!("{} {} {}\r\n", self.method, self.path, self.version);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        writer.write_all(out.as_bytes())?;
        writer.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NoContent,
    BadRequest,
    InternalServerError,
    ServiceUnavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::InternalServerError => 500,
            Status::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::NoContent => "No Content",
            Status::BadRequest => "Bad Request",
            Status::InternalServerError => "Internal Server Error",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            200 => Status::Ok,
            201 => Status::Created,
            204 => Status::NoContent,
            400 => Status::BadRequest,
            500 => Status::InternalServerError,
            503 => Status::ServiceUnavailable,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub lamport_clock: Timestamp,
    pub body: Option<Value>,
}

impl Response {
    pub fn new(status: Status, lamport_clock: Timestamp) -> Self {
        Self {
            status,
            lamport_clock,
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), WireError> {
        let mut out = format!(
            "{PROTOCOL_VERSION} {}\r\n{LAMPORT_CLOCK}: {}\r\n",
            self.status, self.lamport_clock
        );
        match &self.body {
            Some(body) => {
                let body = serde_json::to_string_pretty(body)?;
                out.push_str(&format!("{CONTENT_TYPE}: application/json\r\n"));
                out.push_str(&format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()));
                out.push_str(&body);
            }
            None => out.push_str("\r\n"),
        }
        writer.write_all(out.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// Sends the `LamportClock: <n>` line a replica writes on accepting a connection.
pub fn write_preamble<W: Write + ?Sized>(writer: &mut W, clock: Timestamp) -> io::Result<()> {
    writer.write_all(format!("{LAMPORT_CLOCK}: {clock}\r\n").as_bytes())?;
    writer.flush()
}

/// Reads one request. `Ok(None)` means the peer closed without sending one.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Option<Request>, WireError> {
    let start = loop {
        match read_line(reader)? {
            None => return Ok(None),
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut parts = start.split_whitespace();
    let (Some(verb), Some(path)) = (parts.next(), parts.next()) else {
        return Err(WireError::MalformedStartLine(start.clone()));
    };
    let version = parts.next().unwrap_or(PROTOCOL_VERSION).to_string();
    let method = Method::parse(verb);
    let path = path.to_string();

    let headers = read_headers(reader)?;
    let body = read_body(reader, &headers)?;
    Ok(Some(Request {
        method,
        path,
        version,
        headers,
        body,
    }))
}

/// First thing a server sends on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Greeting {
    /// The replica's clock; the request may now be sent.
    Preamble(Timestamp),
    /// The connection was turned away before any preamble (503).
    Rejected(Response),
}

/// Reads either the clock preamble or an immediate rejection.
pub fn read_greeting<R: BufRead>(reader: &mut R) -> Result<Greeting, WireError> {
    let line = read_line(reader)?.ok_or(WireError::UnexpectedEof)?;
    if line.starts_with("HTTP/") {
        return read_response_after(reader, &line).map(Greeting::Rejected);
    }
    let (name, value) = split_header(&line)?;
    if !name.eq_ignore_ascii_case(LAMPORT_CLOCK) {
        return Err(WireError::MalformedHeader(line.clone()));
    }
    parse_clock(Some(value)).map(Greeting::Preamble)
}

/// Reads a full response, including its JSON body when present.
pub fn read_response<R: BufRead>(reader: &mut R) -> Result<Response, WireError> {
    let start = read_line(reader)?.ok_or(WireError::UnexpectedEof)?;
    read_response_after(reader, &start)
}

fn read_response_after<R: BufRead>(reader: &mut R, start: &str) -> Result<Response, WireError> {
    let code = start
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| WireError::MalformedStartLine(start.to_string()))?;
    let status = Status::from_code(code).ok_or(WireError::UnknownStatus(code))?;

    let headers = read_headers(reader)?;
    let lamport_clock = parse_clock(find_header(&headers, LAMPORT_CLOCK))?;
    let body = read_body(reader, &headers)?;
    let body = if body.trim().is_empty() {
        None
    } else {
        Some(serde_json::from_str(&body)?)
    };
    Ok(Response {
        status,
        lamport_clock,
        body,
    })
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>, WireError> {
    let mut raw = Vec::new();
    let read = reader
        .by_ref()
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', &mut raw)?;
    if read == 0 {
        return Ok(None);
    }
    if read == MAX_LINE_BYTES && !raw.ends_with(b"\n") {
        return Err(WireError::LineTooLong);
    }
    let mut line = String::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)?;
    let trimmed = line.trim_end_matches(LINE_ENDINGS).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>, WireError> {
    let mut headers = Vec::new();
    while let Some(line) = read_line(reader)? {
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(WireError::TooManyHeaders);
        }
        let (name, value) = split_header(&line)?;
        headers.push((name.to_string(), value.to_string()));
    }
    Ok(headers)
}

fn read_body<R: BufRead>(reader: &mut R, headers: &[(String, String)]) -> Result<String, WireError> {
    let Some(length) = find_header(headers, CONTENT_LENGTH) else {
        return Ok(String::new());
    };
    let length: usize = length.parse().map_err(|_| WireError::InvalidNumber {
        name: CONTENT_LENGTH,
        value: length.to_string(),
    })?;
    if length > MAX_BODY_BYTES {
        return Err(WireError::BodyTooLarge(length));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => WireError::UnexpectedEof,
        _ => WireError::Io(err),
    })?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn split_header(line: &str) -> Result<(&str, &str), WireError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| WireError::MalformedHeader(line.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(WireError::MalformedHeader(line.to_string()));
    }
    Ok((name, value.trim()))
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.is_empty())
}

fn parse_clock(value: Option<&str>) -> Result<Timestamp, WireError> {
    match value {
        None => Ok(NO_CLOCK),
        Some(value) => {
            let clock: Timestamp = value.parse().map_err(|_| WireError::InvalidNumber {
                name: LAMPORT_CLOCK,
                value: value.to_string(),
            })?;
            if (NO_CLOCK..=MAX_TIMESTAMP).contains(&clock) {
                Ok(clock)
            } else {
                Err(WireError::ClockOutOfRange(clock))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;

    fn parse(raw: &str) -> Result<Option<Request>, WireError> {
        read_request(&mut Cursor::new(raw.as_bytes().to_vec()))
    }

    #[test]
    fn parses_put_with_body() {
        let body = r#"{"id":"X","v":1}"#;
        let raw = format!(
            "PUT /weather.json HTTP/1.1\r\nSenderID: s-1\r\nLamportClock: 12\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let request = parse(&raw).unwrap().unwrap();
        assert_eq!(request.method, Method::Put);
        assert_eq!(request.header(SENDER_ID), Some("s-1"));
        assert_eq!(request.lamport_clock().unwrap(), 12);
        assert_eq!(request.body, body);
    }

    #[test]
    fn missing_clock_defaults_to_minus_one() {
        let request = parse("GET /weather.json HTTP/1.1\r\nStationID: X\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.lamport_clock().unwrap(), NO_CLOCK);
        assert_eq!(request.header("stationid"), Some("X"));
    }

    #[test]
    fn blank_header_counts_as_absent() {
        let request = parse("GET / HTTP/1.1\r\nStationID:   \r\n\r\n").unwrap().unwrap();
        assert_eq!(request.header(STATION_ID), None);
    }

    #[test]
    fn unknown_verb_is_preserved() {
        let request = parse("DELETE /weather.json HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(request.method, Method::Other("DELETE".into()));
    }

    #[test]
    fn closed_connection_reads_as_none() {
        assert!(parse("").unwrap().is_none());
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(parse("GARBAGE\r\n\r\n"), Err(WireError::MalformedStartLine(_))));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
            Err(WireError::MalformedHeader(_))
        ));
        let bad_clock = parse("GET / HTTP/1.1\r\nLamportClock: soon\r\n\r\n").unwrap().unwrap();
        assert!(matches!(bad_clock.lamport_clock(), Err(WireError::InvalidNumber { .. })));
    }

    #[test]
    fn clock_outside_range_is_rejected() {
        let huge = parse(&format!("GET / HTTP/1.1\r\nLamportClock: {}\r\n\r\n", i64::MAX))
            .unwrap()
            .unwrap();
        let err = huge.lamport_clock().unwrap_err();
        assert!(matches!(err, WireError::ClockOutOfRange(i64::MAX)));
        assert!(err.is_malformed());

        let negative = parse("GET / HTTP/1.1\r\nLamportClock: -7\r\n\r\n").unwrap().unwrap();
        assert!(matches!(negative.lamport_clock(), Err(WireError::ClockOutOfRange(-7))));

        let ceiling = parse(&format!("GET / HTTP/1.1\r\nLamportClock: {MAX_TIMESTAMP}\r\n\r\n"))
            .unwrap()
            .unwrap();
        assert_eq!(ceiling.lamport_clock().unwrap(), MAX_TIMESTAMP);
    }

    #[test]
    fn invalid_utf8_header_is_malformed() {
        let raw = b"GET /weather.json HTTP/1.1\r\nStationID: \xff\xfe\r\n\r\n".to_vec();
        let err = read_request(&mut Cursor::new(raw)).unwrap_err();
        assert!(matches!(err, WireError::InvalidUtf8));
        assert!(err.is_malformed());
        assert!(WireError::Io(io::Error::from(io::ErrorKind::InvalidData)).is_malformed());
    }

    #[test]
    fn oversized_lines_and_header_floods_are_rejected() {
        let long = format!("GET / HTTP/1.1\r\nStationID: {}\r\n\r\n", "x".repeat(MAX_LINE_BYTES));
        assert!(matches!(parse(&long), Err(WireError::LineTooLong)));

        let endless = "GET /".to_string() + &"a".repeat(4 * MAX_LINE_BYTES);
        assert!(matches!(parse(&endless), Err(WireError::LineTooLong)));

        let mut flood = "GET / HTTP/1.1\r\n".to_string();
        for n in 0..=MAX_HEADERS {
            flood.push_str(&format!("X-{n}: 1\r\n"));
        }
        flood.push_str("\r\n");
        let err = parse(&flood).unwrap_err();
        assert!(matches!(err, WireError::TooManyHeaders));
        assert!(err.is_malformed());

        let mut allowed = "GET / HTTP/1.1\r\n".to_string();
        for n in 0..MAX_HEADERS {
            allowed.push_str(&format!("X-{n}: 1\r\n"));
        }
        allowed.push_str("\r\n");
        assert_eq!(parse(&allowed).unwrap().unwrap().headers.len(), MAX_HEADERS);
    }

    #[test]
    fn truncated_body_is_unexpected_eof() {
        let err = parse("PUT / HTTP/1.1\r\nContent-Length: 50\r\n\r\n{}").unwrap_err();
        assert!(matches!(err, WireError::UnexpectedEof));
        assert!(!err.is_malformed());
    }

    #[test]
    fn response_with_body_reads_back() {
        let response = Response::new(Status::Ok, 17).with_body(json!({ "id": "X", "v": 1 }));
        let mut buf = Vec::new();
        response.write_to(&mut buf).unwrap();

        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nLamportClock: 17\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));

        let parsed = read_response(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn empty_response_has_no_body_headers() {
        let mut buf = Vec::new();
        Response::new(Status::ServiceUnavailable, NO_CLOCK)
            .write_to(&mut buf)
            .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "HTTP/1.1 503 Service Unavailable\r\nLamportClock: -1\r\n\r\n"
        );
    }

    #[test]
    fn preamble_precedes_request() {
        let mut buf = Vec::new();
        write_preamble(&mut buf, 41).unwrap();
        Request::get(Some("X"), 42).write_to(&mut buf).unwrap();

        let mut reader = Cursor::new(buf);
        assert_eq!(read_greeting(&mut reader).unwrap(), Greeting::Preamble(41));
        let request = read_request(&mut reader).unwrap().unwrap();
        assert_eq!(request.lamport_clock().unwrap(), 42);
        assert_eq!(request.header(STATION_ID), Some("X"));
    }

    #[test]
    fn rejection_arrives_in_place_of_preamble() {
        let mut buf = Vec::new();
        Response::new(Status::ServiceUnavailable, NO_CLOCK)
            .write_to(&mut buf)
            .unwrap();

        let greeting = read_greeting(&mut Cursor::new(buf)).unwrap();
        assert_eq!(
            greeting,
            Greeting::Rejected(Response::new(Status::ServiceUnavailable, NO_CLOCK))
        );
        assert!(matches!(
            read_greeting(&mut Cursor::new(b"Hello: 1\r\n".to_vec())),
            Err(WireError::MalformedHeader(_))
        ));
    }

    #[test]
    fn put_builder_sets_content_length() {
        let request = Request::put("sender", 3, &json!({ "id": "X" })).unwrap();
        let mut buf = Vec::new();
        request.write_to(&mut buf).unwrap();

        let parsed = read_request(&mut Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(parsed, request);
        let declared: usize = parsed.header(CONTENT_LENGTH).unwrap().parse().unwrap();
        assert_eq!(declared, parsed.body.len());
    }
}
