//! Round-robin front door for a group of replicas.
//!
//! The dispatcher never parses requests. It accepts a connection, picks the
//! next live backend and hands the raw connection over; the backend writes
//! the clock preamble and answers. With no live backend the client gets a
//! 503 stamped `LamportClock: -1`.
//!
//! Rotation and pruning share one lock. The periodic liveness probe removes
//! backends that fail to answer; they only come back through
//! [`Dispatcher::add_server`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, ensure};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{DispatcherConfig, ReplicaConfig, StoreConfig};
use crate::deployment::Deployment;
use crate::replica::Replica;
use crate::schedule::PeriodicTask;
use crate::transport::{Acceptor, Connection, TcpTransport, Transport};
use crate::wire::{NO_CLOCK, Response, Status};

/// Something the dispatcher can route connections to.
pub trait Backend: Send + Sync {
    /// Unique name; the registry refuses two backends with the same name.
    fn name(&self) -> &str;

    fn is_alive(&self) -> bool;

    /// Takes ownership of a client connection and answers it.
    fn admit(&self, connection: Box<dyn Connection>);

    fn shutdown(&self);
}

impl Backend for Replica {
    fn name(&self) -> &str {
        Replica::name(self)
    }

    fn is_alive(&self) -> bool {
        Replica::is_alive(self)
    }

    fn admit(&self, connection: Box<dyn Connection>) {
        Replica::admit(self, connection);
    }

    fn shutdown(&self) {
        Replica::shutdown(self);
    }
}

/// Ordered backends plus the index where the next scan starts.
#[derive(Default)]
struct Registry {
    backends: Vec<Arc<dyn Backend>>,
    cursor: usize,
}

impl Registry {
    fn add(&mut self, backend: Arc<dyn Backend>) -> bool {
        if self.backends.iter().any(|known| known.name() == backend.name()) {
            return false;
        }
        self.backends.push(backend);
        true
    }

    /// Removes `name`, keeping the cursor on the same next backend.
    fn remove(&mut self, name: &str) -> Option<Arc<dyn Backend>> {
        let index = self.backends.iter().position(|backend| backend.name() == name)?;
        let removed = self.backends.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.backends.len() {
            self.cursor = 0;
        }
        Some(removed)
    }

    /// Scans at most once around the ring for a live backend.
    fn next(&mut self) -> Option<Arc<dyn Backend>> {
        let len = self.backends.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            if self.backends[index].is_alive() {
                self.cursor = (index + 1) % len;
                return Some(Arc::clone(&self.backends[index]));
            }
        }
        None
    }

    fn prune(&mut self) -> Vec<Arc<dyn Backend>> {
        let dead: Vec<String> = self
            .backends
            .iter()
            .filter(|backend| !backend.is_alive())
            .map(|backend| backend.name().to_string())
            .collect();
        dead.iter().filter_map(|name| self.remove(name)).collect()
    }

    fn names(&self) -> Vec<String> {
        self.backends.iter().map(|backend| backend.name().to_string()).collect()
    }
}

pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    probe: Mutex<Option<PeriodicTask>>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    local_addr: SocketAddr,
    registry: Mutex<Registry>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn start(config: DispatcherConfig, backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        Self::start_with(config, backends, Arc::new(TcpTransport))
    }

    /// Binds `config.listen` and starts the accept loop and liveness probe.
    ///
    /// The probe's first pass runs right away.
    pub fn start_with(
        config: DispatcherConfig,
        backends: Vec<Arc<dyn Backend>>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let acceptor = transport
            .bind(config.listen)
            .with_context(|| format!("failed to bind dispatcher on {}", config.listen))?;
        let local_addr = acceptor
            .local_addr()
            .context("failed to read dispatcher listen address")?;

        let mut registry = Registry::default();
        for backend in backends {
            if !registry.add(backend) {
                warn!("duplicate backend ignored");
            }
        }

        let inner = Arc::new(DispatcherInner {
            config,
            local_addr,
            registry: Mutex::new(registry),
            shutting_down: AtomicBool::new(false),
        });
        let dispatcher = Self {
            inner,
            accept_thread: Mutex::new(None),
            probe: Mutex::new(None),
        };

        let inner = Arc::clone(&dispatcher.inner);
        let accept = thread::Builder::new()
            .name(format!("dispatcher-accept-{}", local_addr.port()))
            .spawn(move || inner.accept_loop(acceptor))
            .context("failed to spawn dispatcher accept thread")?;
        *dispatcher.accept_thread.lock() = Some(accept);

        let weak: Weak<DispatcherInner> = Arc::downgrade(&dispatcher.inner);
        let probe = PeriodicTask::spawn(
            "dispatcher-probe",
            dispatcher.inner.config.probe_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.check_health();
                }
                Ok(())
            },
        )?;
        *dispatcher.probe.lock() = Some(probe);

        info!(addr = %local_addr, backends = ?dispatcher.servers(), "dispatcher started");
        Ok(dispatcher)
    }

    /// Opens a deployment and starts `count` replicas behind a new dispatcher.
    ///
    /// Replicas listen on the dispatcher's IP at ports `port + 1 ..= port +
    /// count`. With port 0 everything binds to ephemeral ports.
    pub fn launch(listen: SocketAddr, count: usize, store_config: StoreConfig) -> Result<Self> {
        ensure!(count > 0, "a dispatcher needs at least one replica");
        let deployment = Deployment::open(store_config)?;

        let mut backends: Vec<Arc<dyn Backend>> = Vec::with_capacity(count);
        for offset in 1..=count {
            let port = if listen.port() == 0 {
                0
            } else {
                u16::try_from(offset)
                    .ok()
                    .and_then(|offset| listen.port().checked_add(offset))
                    .with_context(|| format!("replica {offset} has no port above {}", listen.port()))?
            };
            let replica = Replica::start(ReplicaConfig::new(SocketAddr::new(listen.ip(), port)), &deployment)?;
            backends.push(Arc::new(replica));
        }

        Self::start(DispatcherConfig::new(listen), backends)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Adds a backend to the rotation. Returns `false` if one with the same
    /// name is already registered.
    pub fn add_server(&self, backend: Arc<dyn Backend>) -> bool {
        let name = backend.name().to_string();
        let added = self.inner.registry.lock().add(backend);
        if added {
            info!(backend = %name, "backend added");
        }
        added
    }

    /// Takes a backend out of rotation without shutting it down.
    pub fn remove_server(&self, name: &str) -> Option<Arc<dyn Backend>> {
        let removed = self.inner.registry.lock().remove(name);
        if removed.is_some() {
            info!(backend = %name, "backend removed");
        }
        removed
    }

    /// The next live backend in rotation, if any.
    pub fn next(&self) -> Option<Arc<dyn Backend>> {
        self.inner.registry.lock().next()
    }

    /// Names of the backends currently in rotation, in order.
    pub fn servers(&self) -> Vec<String> {
        self.inner.registry.lock().names()
    }

    /// Probes every backend now and drops the ones that fail. Returns the
    /// names removed.
    pub fn check_health(&self) -> Vec<String> {
        self.inner.check_health()
    }

    /// Stops accepting, runs a final probe, shuts every backend down and
    /// closes the listener. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(addr = %self.inner.local_addr, "dispatcher shutting down");

        let accept = self.accept_thread.lock().take();
        if let Some(handle) = accept {
            if handle.join().is_err() {
                warn!("dispatcher accept thread panicked");
            }
        }

        let probe = self.probe.lock().take();
        if let Some(probe) = probe {
            probe.stop(self.inner.config.shutdown_grace);
        }
        self.inner.check_health();

        let backends = std::mem::take(&mut self.inner.registry.lock().backends);
        for backend in backends {
            debug!(backend = %backend.name(), "stopping backend");
            backend.shutdown();
        }
        info!(addr = %self.inner.local_addr, "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DispatcherInner {
    fn accept_loop(&self, acceptor: Box<dyn Acceptor>) {
        let poll = self.config.poll_interval;
        while !self.shutting_down.load(Ordering::Acquire) {
            match acceptor.accept_timeout(poll) {
                Ok(Some(connection)) => self.dispatch(connection),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "dispatcher accept failed");
                    thread::sleep(poll);
                }
            }
        }
        debug!("dispatcher accept loop stopped");
    }

    fn dispatch(&self, mut connection: Box<dyn Connection>) {
        let chosen = self.registry.lock().next();
        match chosen {
            Some(backend) => {
                debug!(peer = %connection.peer(), backend = %backend.name(), "forwarding connection");
                backend.admit(connection);
            }
            None => {
                warn!(peer = %connection.peer(), "no live backend, answering 503");
                let response = Response::new(Status::ServiceUnavailable, NO_CLOCK);
                if let Err(err) = response.write_to(&mut connection) {
                    debug!(error = %err, "failed to send 503");
                }
            }
        }
    }

    fn check_health(&self) -> Vec<String> {
        let pruned = self.registry.lock().prune();
        // Dropped outside the lock: releasing the last handle to a replica shuts it down.
        let names: Vec<String> = pruned.iter().map(|backend| backend.name().to_string()).collect();
        for name in &names {
            warn!(backend = %name, "backend failed liveness probe, removed from rotation");
        }
        names
    }
}
