//! Replica server: admits connections, queues them, and serves reads and
//! writes against the deployment's store.
//!
//! Threads per replica:
//!
//! - **Accept thread**: polls the listener, writes the clock preamble to each
//!   new connection and pushes it onto a bounded admission queue. A full
//!   queue turns the connection away with 503 straight from this thread.
//! - **Worker threads**: pop connections, read exactly one request, answer it
//!   and close the connection.
//!
//! Every response is stamped with the replica's clock after a tick and a
//! synchronization with the shared clock, so response stamps from one
//! replica are strictly increasing.

use std::io::BufReader;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::{LamportClock, Timestamp};
use crate::config::ReplicaConfig;
use crate::deployment::Deployment;
use crate::reading::{Reading, freshest_visible, station_id_of};
use crate::store::{starts_new_session, wall_clock_now};
use crate::transport::{Acceptor, Connection, TcpTransport, Transport};
use crate::wire::{self, Method, NO_CLOCK, Request, Response, SENDER_ID, STATION_ID, Status};

/// A running replica. Dropping it shuts it down.
pub struct Replica {
    inner: Arc<ReplicaInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct ReplicaInner {
    name: String,
    config: ReplicaConfig,
    local_addr: SocketAddr,
    clock: LamportClock,
    deployment: Deployment,
    transport: Arc<dyn Transport>,
    queue_tx: Sender<Box<dyn Connection>>,
    queue_rx: Receiver<Box<dyn Connection>>,
    shutting_down: AtomicBool,
}

impl Replica {
    /// Binds `config.listen` over TCP and starts serving.
    pub fn start(config: ReplicaConfig, deployment: &Deployment) -> Result<Self> {
        Self::start_with(config, deployment, Arc::new(TcpTransport))
    }

    /// Starts a replica on an arbitrary transport.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the address cannot be bound,
    /// or the store cannot start its background tasks. Nothing is left
    /// registered with the store on failure.
    pub fn start_with(
        config: ReplicaConfig,
        deployment: &Deployment,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let acceptor = transport
            .bind(config.listen)
            .with_context(|| format!("failed to bind replica on {}", config.listen))?;
        let local_addr = acceptor
            .local_addr()
            .context("failed to read replica listen address")?;

        deployment.store().register_replica()?;
        // Restored readings keep their logical times; the shared clock must not trail them.
        if let Some(latest) = deployment.store().latest_logical_time() {
            deployment.shared_clock().receive(latest);
        }
        let clock = LamportClock::starting_at(deployment.shared_clock().value());
        let (queue_tx, queue_rx) = bounded(config.queue_capacity);

        let inner = Arc::new(ReplicaInner {
            name: format!("replica@{local_addr}"),
            config,
            local_addr,
            clock,
            deployment: deployment.clone(),
            transport,
            queue_tx,
            queue_rx,
            shutting_down: AtomicBool::new(false),
        });
        let replica = Self {
            inner,
            threads: Mutex::new(Vec::new()),
        };
        // On failure `replica` is dropped, which runs the normal shutdown.
        replica.spawn_threads(acceptor)?;

        info!(replica = %replica.inner.name, "replica started");
        Ok(replica)
    }

    fn spawn_threads(&self, acceptor: Box<dyn Acceptor>) -> Result<()> {
        let port = self.inner.local_addr.port();
        let mut threads = self.threads.lock();

        let inner = Arc::clone(&self.inner);
        threads.push(
            thread::Builder::new()
                .name(format!("replica-accept-{port}"))
                .spawn(move || inner.accept_loop(acceptor))
                .context("failed to spawn accept thread")?,
        );

        for worker in 0..self.inner.config.workers {
            let inner = Arc::clone(&self.inner);
            threads.push(
                thread::Builder::new()
                    .name(format!("replica-worker-{port}-{worker}"))
                    .spawn(move || inner.worker_loop())
                    .context("failed to spawn worker thread")?,
            );
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Current value of this replica's local clock.
    pub fn clock_value(&self) -> Timestamp {
        self.inner.clock.value()
    }

    /// Hands a freshly accepted connection to this replica.
    ///
    /// Writes the preamble and queues the connection, or answers 503 if the
    /// queue is full or the replica is shutting down.
    pub fn admit(&self, connection: Box<dyn Connection>) {
        self.inner.admit(connection);
    }

    /// Processes one parsed request and returns the response to send.
    pub fn handle_request(&self, request: &Request) -> Response {
        self.inner.handle_request(request)
    }

    /// Probes the replica's own listening address.
    pub fn is_alive(&self) -> bool {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        self.inner
            .transport
            .connect_timeout(self.inner.local_addr, self.inner.config.probe_timeout)
            .is_ok()
    }

    /// Stops accepting, finishes in-flight requests, answers queued ones
    /// with 503 and releases the store.
    ///
    /// The last replica of a deployment to shut down also resets the shared
    /// clock to zero. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(replica = %self.inner.name, "replica shutting down");

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!(replica = %self.inner.name, "replica thread panicked");
            }
        }

        let mut rejected = 0usize;
        while let Ok(connection) = self.inner.queue_rx.try_recv() {
            self.inner.reject(connection);
            rejected += 1;
        }
        if rejected > 0 {
            debug!(replica = %self.inner.name, rejected, "rejected queued connections");
        }

        let store = self.inner.deployment.store();
        if let Err(err) = store.persist() {
            warn!(replica = %self.inner.name, error = %err, "snapshot on shutdown failed");
        }
        if store.deregister_replica() {
            self.inner.deployment.shared_clock().reset(0);
        }
        info!(replica = %self.inner.name, "replica stopped");
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ReplicaInner {
    fn accept_loop(&self, acceptor: Box<dyn Acceptor>) {
        let poll = self.config.poll_interval;
        while !self.shutting_down.load(Ordering::Acquire) {
            match acceptor.accept_timeout(poll) {
                Ok(Some(connection)) => self.admit(connection),
                Ok(None) => {}
                Err(err) => {
                    warn!(replica = %self.name, error = %err, "accept failed");
                    thread::sleep(poll);
                }
            }
        }
        debug!(replica = %self.name, "accept loop stopped");
    }

    fn worker_loop(&self) {
        while !self.shutting_down.load(Ordering::Acquire) {
            match self.queue_rx.recv_timeout(self.config.poll_interval) {
                Ok(connection) => {
                    // A panic drops only this connection; the worker keeps serving.
                    if panic::catch_unwind(AssertUnwindSafe(|| self.serve(connection))).is_err() {
                        warn!(replica = %self.name, "request handler panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn admit(&self, mut connection: Box<dyn Connection>) {
        if self.shutting_down.load(Ordering::Acquire) {
            self.reject(connection);
            return;
        }

        // The preamble must cover every write already folded into the shared clock.
        let preamble = self.clock.catch_up(self.deployment.shared_clock());
        if let Err(err) = wire::write_preamble(&mut *connection, preamble) {
            debug!(replica = %self.name, peer = %connection.peer(), error = %err, "failed to write preamble");
            return;
        }

        match self.queue_tx.try_send(connection) {
            Ok(()) => {}
            Err(TrySendError::Full(connection)) => {
                warn!(replica = %self.name, peer = %connection.peer(), "admission queue full");
                self.reject(connection);
            }
            Err(TrySendError::Disconnected(connection)) => self.reject(connection),
        }
    }

    fn reject(&self, mut connection: Box<dyn Connection>) {
        let response = Response::new(Status::ServiceUnavailable, self.clock.value());
        if let Err(err) = response.write_to(&mut connection) {
            debug!(replica = %self.name, peer = %connection.peer(), error = %err, "failed to send 503");
        }
    }

    fn serve(&self, connection: Box<dyn Connection>) {
        let peer = connection.peer();
        if let Err(err) = connection.set_read_timeout(Some(self.config.read_timeout)) {
            debug!(replica = %self.name, %peer, error = %err, "failed to set read timeout");
        }

        let mut reader = BufReader::new(connection);
        let response = match wire::read_request(&mut reader) {
            Ok(Some(request)) => self.handle_request(&request),
            Ok(None) => {
                debug!(replica = %self.name, %peer, "connection closed without a request");
                return;
            }
            Err(err) if err.is_malformed() => {
                debug!(replica = %self.name, %peer, error = %err, "rejecting malformed request");
                self.respond(Status::BadRequest)
            }
            Err(err) => {
                debug!(replica = %self.name, %peer, error = %err, "failed to read request");
                return;
            }
        };

        let mut connection = reader.into_inner();
        if let Err(err) = response.write_to(&mut connection) {
            debug!(replica = %self.name, %peer, error = %err, "failed to send response");
        }
    }

    fn handle_request(&self, request: &Request) -> Response {
        let peer_clock = match request.lamport_clock() {
            Ok(clock) => clock,
            Err(err) => {
                debug!(replica = %self.name, error = %err, "bad LamportClock header");
                return self.respond(Status::BadRequest);
            }
        };

        let shared = self.deployment.shared_clock();
        self.clock.receive(peer_clock);
        self.clock.sync_with(shared);
        let now = self.clock.value();

        match &request.method {
            Method::Get => self.handle_get(request, peer_clock, now),
            Method::Put => self.handle_put(request, now),
            Method::Other(verb) => {
                debug!(replica = %self.name, %verb, "unsupported method");
                self.respond(Status::BadRequest)
            }
        }
    }

    fn handle_get(&self, request: &Request, peer_clock: Timestamp, now: Timestamp) -> Response {
        // Readers without a clock see everything this replica has seen.
        let visible_at = if peer_clock == NO_CLOCK { now } else { peer_clock };
        let store = self.deployment.store();

        let station = match request.header(STATION_ID) {
            Some(station) => station.to_string(),
            None => match store.any_station_id() {
                Some(station) => station,
                None => return self.respond(Status::NoContent),
            },
        };

        let payload = store
            .get(&station)
            .and_then(|ledger| freshest_visible(&ledger, visible_at).map(|reading| reading.payload().clone()));
        match payload {
            Some(payload) => {
                debug!(replica = %self.name, %station, visible_at, "serving reading");
                self.respond_with(Status::Ok, payload)
            }
            None => self.respond(Status::NoContent),
        }
    }

    fn handle_put(&self, request: &Request, now: Timestamp) -> Response {
        let Some(source) = request.header(SENDER_ID) else {
            debug!(replica = %self.name, "write without SenderID");
            return self.respond(Status::BadRequest);
        };

        let payload: Value = match serde_json::from_str(&request.body) {
            Ok(payload @ Value::Object(_)) => payload,
            Ok(_) => {
                warn!(replica = %self.name, %source, "payload is not a json object");
                return self.respond(Status::InternalServerError);
            }
            Err(err) => {
                warn!(replica = %self.name, %source, error = %err, "payload failed to parse");
                return self.respond(Status::InternalServerError);
            }
        };
        let Some(station) = station_id_of(&payload) else {
            debug!(replica = %self.name, %source, "payload has no station id");
            return self.respond(Status::BadRequest);
        };

        let store = self.deployment.store();
        let seen_at = wall_clock_now();
        let previous = store.commit(&station, Reading::new(payload, now, source), seen_at);
        let status = if starts_new_session(previous, seen_at, store.staleness_threshold()) {
            Status::Created
        } else {
            Status::Ok
        };
        info!(replica = %self.name, %station, %source, logical_time = now, %status, "committed reading");
        self.respond(status)
    }

    fn stamp(&self) -> Timestamp {
        self.clock.tick();
        self.clock.sync_with(self.deployment.shared_clock());
        self.clock.value()
    }

    fn respond(&self, status: Status) -> Response {
        Response::new(status, self.stamp())
    }

    fn respond_with(&self, status: Status, body: Value) -> Response {
        self.respond(status).with_body(body)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::StoreConfig;
    use crate::transport::{MemoryConnection, WrittenBytes};

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn deployment(dir: &TempDir, threshold: Duration) -> Deployment {
        let mut config = StoreConfig::new(dir.path());
        config.staleness_threshold = threshold;
        Deployment::open(config).unwrap()
    }

    fn replica(deployment: &Deployment) -> Replica {
        Replica::start(ReplicaConfig::new(localhost()), deployment).unwrap()
    }

    fn put(sender: &str, payload: Value) -> Request {
        Request::put(sender, NO_CLOCK, &payload).unwrap()
    }

    fn wait_for_response(written: &WrittenBytes) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let text = written.to_text();
            if text.contains("HTTP/1.1") || Instant::now() > deadline {
                return text;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn first_write_creates_then_updates() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let first = replica.handle_request(&put("station-a", json!({"id": "IDS60901", "air_temp": 13.3})));
        let second = replica.handle_request(&put("station-a", json!({"id": "IDS60901", "air_temp": 14.1})));
        assert_eq!(first.status, Status::Created);
        assert_eq!(second.status, Status::Ok);
        assert!(second.lamport_clock > first.lamport_clock);
    }

    #[test]
    fn write_after_silence_counts_as_new_session() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_millis(100));
        let replica = replica(&deployment);
        let request = put("station-a", json!({"id": "IDS60901"}));

        assert_eq!(replica.handle_request(&request).status, Status::Created);
        assert_eq!(replica.handle_request(&request).status, Status::Ok);
        thread::sleep(Duration::from_millis(250));
        assert_eq!(replica.handle_request(&request).status, Status::Created);
    }

    #[test]
    fn rejects_bad_writes() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let anonymous = Request::new(Method::Put).with_body(r#"{"id":"X"}"#);
        assert_eq!(replica.handle_request(&anonymous).status, Status::BadRequest);

        let garbage = Request::new(Method::Put)
            .with_header(SENDER_ID, "station-a")
            .with_body("{not json");
        assert_eq!(replica.handle_request(&garbage).status, Status::InternalServerError);

        let no_id = put("station-a", json!({"air_temp": 1.0}));
        assert_eq!(replica.handle_request(&no_id).status, Status::BadRequest);

        let not_object = put("station-a", json!([1, 2, 3]));
        assert_eq!(replica.handle_request(&not_object).status, Status::InternalServerError);

        assert!(deployment.store().is_empty());
    }

    #[test]
    fn unknown_method_and_bad_clock_are_bad_requests() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let delete = Request::new(Method::Other("DELETE".to_string()));
        assert_eq!(replica.handle_request(&delete).status, Status::BadRequest);

        let bad_clock = Request::new(Method::Get).with_header(wire::LAMPORT_CLOCK, "soon");
        assert_eq!(replica.handle_request(&bad_clock).status, Status::BadRequest);
    }

    #[test]
    fn get_on_empty_store_is_no_content() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        assert_eq!(replica.handle_request(&Request::get(None, NO_CLOCK)).status, Status::NoContent);
        assert_eq!(
            replica.handle_request(&Request::get(Some("IDS60901"), NO_CLOCK)).status,
            Status::NoContent
        );
    }

    #[test]
    fn get_without_station_returns_some_station() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);
        replica.handle_request(&put("station-a", json!({"id": "IDS60901", "air_temp": 13.3})));

        let response = replica.handle_request(&Request::get(None, NO_CLOCK));
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.body, Some(json!({"id": "IDS60901", "air_temp": 13.3})));
    }

    #[test]
    fn declared_clock_bounds_what_a_reader_sees() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let first = replica.handle_request(&put("station-a", json!({"id": "S", "n": 1})));
        replica.handle_request(&put("station-a", json!({"id": "S", "n": 2})));

        let early = replica.handle_request(&Request::get(Some("S"), 0));
        assert_eq!(early.status, Status::NoContent);

        let between = replica.handle_request(&Request::get(Some("S"), first.lamport_clock));
        assert_eq!(between.body, Some(json!({"id": "S", "n": 1})));

        let latest = replica.handle_request(&Request::get(Some("S"), NO_CLOCK));
        assert_eq!(latest.body, Some(json!({"id": "S", "n": 2})));
    }

    #[test]
    fn numeric_station_ids_are_accepted() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let response = replica.handle_request(&put("station-a", json!({"id": 94672, "air_temp": 9.0})));
        assert_eq!(response.status, Status::Created);
        let read = replica.handle_request(&Request::get(Some("94672"), NO_CLOCK));
        assert_eq!(read.status, Status::Ok);
    }

    #[test]
    fn response_stamps_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let mut last = NO_CLOCK;
        for n in 0..20 {
            let request = if n % 2 == 0 {
                put("station-a", json!({"id": "S", "n": n}))
            } else {
                Request::get(Some("S"), last)
            };
            let response = replica.handle_request(&request);
            assert!(response.lamport_clock > last, "{} <= {last}", response.lamport_clock);
            last = response.lamport_clock;
        }
        assert!(deployment.shared_clock().value() >= replica.clock_value() - 1);
    }

    #[test]
    fn admitted_connection_gets_preamble_then_response() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let (connection, written) =
            MemoryConnection::new("GET /weather.json HTTP/1.1\r\nLamportClock: 0\r\n\r\n");
        replica.admit(Box::new(connection));

        let text = wait_for_response(&written);
        assert!(text.starts_with("LamportClock: "), "{text}");
        assert!(text.contains("HTTP/1.1 204 No Content"), "{text}");
    }

    #[test]
    fn malformed_request_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let (connection, written) = MemoryConnection::new("NONSENSE\r\n\r\n");
        replica.inner.serve(Box::new(connection));
        assert!(written.to_text().starts_with("HTTP/1.1 400 Bad Request"));
    }

    #[test]
    fn undecodable_header_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);

        let (connection, written) =
            MemoryConnection::new(&b"GET /weather.json HTTP/1.1\r\nStationID: \xff\xfe\r\n\r\n"[..]);
        replica.inner.serve(Box::new(connection));
        assert!(written.to_text().starts_with("HTTP/1.1 400 Bad Request"), "{}", written.to_text());
    }

    #[test]
    fn clock_at_integer_limit_is_refused_and_worker_survives() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);
        let before = replica.clock_value();

        let refused = replica.handle_request(&Request::get(Some("X"), i64::MAX));
        assert_eq!(refused.status, Status::BadRequest);
        assert!(refused.lamport_clock > before);
        assert!(refused.lamport_clock < i64::MAX / 2);

        let (connection, written) = MemoryConnection::new(format!(
            "GET /weather.json HTTP/1.1\r\nLamportClock: {}\r\n\r\n",
            i64::MAX
        ));
        replica.admit(Box::new(connection));
        assert!(wait_for_response(&written).contains("HTTP/1.1 400 Bad Request"));

        let (connection, written) =
            MemoryConnection::new("GET /weather.json HTTP/1.1\r\nLamportClock: 0\r\n\r\n");
        replica.admit(Box::new(connection));
        assert!(wait_for_response(&written).contains("HTTP/1.1 204 No Content"));
    }

    #[test]
    fn shutdown_refuses_new_connections() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let replica = replica(&deployment);
        assert!(replica.is_alive());

        replica.shutdown();
        assert!(!replica.is_alive());

        let (connection, written) = MemoryConnection::new("GET /weather.json HTTP/1.1\r\n\r\n");
        replica.admit(Box::new(connection));
        assert!(written.to_text().starts_with("HTTP/1.1 503 Service Unavailable"));
    }

    #[test]
    fn last_replica_out_persists_and_resets_shared_clock() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        let first = replica(&deployment);
        let second = replica(&deployment);
        assert_eq!(deployment.store().replica_count(), 2);

        first.handle_request(&put("station-a", json!({"id": "IDS60901"})));
        first.shutdown();
        assert!(deployment.shared_clock().value() > 0);
        assert_eq!(deployment.store().station_ids(), vec!["IDS60901".to_string()]);

        second.shutdown();
        assert_eq!(deployment.shared_clock().value(), 0);
        assert_eq!(deployment.store().replica_count(), 0);
        assert!(deployment.store().is_empty());

        let reopened = Deployment::open(StoreConfig::new(dir.path())).unwrap();
        assert_eq!(reopened.store().station_ids(), vec!["IDS60901".to_string()]);
    }

    #[test]
    fn new_replica_starts_from_shared_clock() {
        let dir = TempDir::new().unwrap();
        let deployment = deployment(&dir, Duration::from_secs(40));
        deployment.shared_clock().receive(41);

        let replica = replica(&deployment);
        assert_eq!(replica.clock_value(), 42);
    }
}
