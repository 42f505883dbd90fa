//! Configuration for the store, replicas, and dispatcher.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};

/// Port used by both binaries when none is given.
pub const DEFAULT_PORT: u16 = 4567;

/// How long a content source may stay silent before its readings are evicted.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(40);

/// Settings for a [`ReadingStore`](crate::store::ReadingStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the ledger and source snapshots.
    pub data_dir: PathBuf,
    /// Silence after which a source and all its readings are dropped.
    pub staleness_threshold: Duration,
    /// Cadence of the background snapshot task.
    pub save_interval: Duration,
    /// Cadence of the background eviction task.
    pub eviction_interval: Duration,
    /// Upper bound on waiting for background tasks to stop.
    pub shutdown_grace: Duration,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.staleness_threshold.is_zero(),
            "staleness threshold must be positive"
        );
        ensure!(!self.save_interval.is_zero(), "save interval must be positive");
        ensure!(
            !self.eviction_interval.is_zero(),
            "eviction interval must be positive"
        );
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            staleness_threshold: STALENESS_THRESHOLD,
            save_interval: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(21),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Settings for one [`Replica`](crate::replica::Replica).
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Address to listen on; port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Connections that may wait for a worker before new ones get 503.
    pub queue_capacity: usize,
    /// Threads pulling connections off the admission queue.
    pub workers: usize,
    /// How often blocked loops wake up to look at the shutdown flag.
    pub poll_interval: Duration,
    /// Connect timeout used by liveness probes.
    pub probe_timeout: Duration,
    /// Read timeout applied to each client connection.
    pub read_timeout: Duration,
}

impl ReplicaConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.queue_capacity > 0, "queue capacity must be positive");
        ensure!(self.workers > 0, "a replica needs at least one worker");
        ensure!(!self.poll_interval.is_zero(), "poll interval must be positive");
        Ok(())
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            queue_capacity: 1024,
            workers: 1,
            poll_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// Settings for the [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen: SocketAddr,
    /// Cadence of the liveness probe that prunes dead replicas.
    pub probe_interval: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl DispatcherConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.probe_interval.is_zero(), "probe interval must be positive");
        ensure!(!self.poll_interval.is_zero(), "poll interval must be positive");
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            probe_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}
