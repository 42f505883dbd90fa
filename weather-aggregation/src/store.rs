//! Concurrent, persistent, self-expiring reading store.
//!
//! One `ReadingStore` is shared by every replica in a deployment. It holds
//! two maps behind a single lock:
//!
//! - **ledgers**: station id → readings ordered by logical time
//! - **sources**: content source id → wall-clock millis of its last write
//!
//! Holding both under one `Mutex` makes `put`, `get` and `evict_stale`
//! mutually exclusive, so a reader can never observe a half-purged ledger.
//!
//! The store also reference-counts the replicas using it. The first
//! registration starts the background snapshot and eviction tasks; the last
//! deregistration stops them, runs a final eviction, persists, and clears
//! memory.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Timestamp;
use crate::config::StoreConfig;
use crate::reading::Reading;
use crate::schedule::PeriodicTask;
use crate::snapshot::{SnapshotError, SnapshotFile};

/// Wall-clock time in milliseconds since the Unix epoch.
pub type WallClock = u64;

/// Station id → readings, each ledger sorted by logical time.
pub type Ledgers = BTreeMap<String, Vec<Reading>>;

/// Source id → wall-clock time of its most recent accepted write.
pub type SourceTable = BTreeMap<String, WallClock>;

/// Milliseconds since the Unix epoch; 0 if the system clock is before it.
pub fn wall_clock_now() -> WallClock {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| WallClock::try_from(elapsed.as_millis()).unwrap_or(WallClock::MAX))
        .unwrap_or(0)
}

/// Whether a write seen at `now` opens a new session for its source: either
/// the source was unknown, or it was silent for longer than `threshold`.
pub fn starts_new_session(previous: Option<WallClock>, now: WallClock, threshold: Duration) -> bool {
    match previous {
        None => true,
        Some(previous) => u128::from(now.saturating_sub(previous)) > threshold.as_millis(),
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub sources: usize,
    pub readings: usize,
    pub stations: usize,
}

impl Eviction {
    pub fn is_empty(&self) -> bool {
        self.sources == 0 && self.readings == 0 && self.stations == 0
    }
}

#[derive(Default)]
struct StoreState {
    ledgers: Ledgers,
    sources: SourceTable,
    replicas: usize,
    cleared: bool,
}

struct Background {
    save: PeriodicTask,
    evict: PeriodicTask,
}

pub struct ReadingStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    ledger_file: SnapshotFile,
    sources_file: SnapshotFile,
    /// Keeps snapshot writes in order; always taken before `state`.
    save_lock: Mutex<()>,
    /// Background tasks; also serializes replica registration transitions.
    background: Mutex<Option<Background>>,
}

impl ReadingStore {
    /// Creates a store over `config.data_dir` and restores any snapshot found there.
    pub fn open(config: StoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let store = Self {
            ledger_file: SnapshotFile::new(&config.data_dir, "ledger"),
            sources_file: SnapshotFile::new(&config.data_dir, "sources"),
            config,
            state: Mutex::new(StoreState::default()),
            save_lock: Mutex::new(()),
            background: Mutex::new(None),
        };
        store.restore();
        Ok(Arc::new(store))
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.config.staleness_threshold
    }

    /// Appends `reading` to the station's ledger, creating it if needed.
    ///
    /// Readings with equal logical times are all kept, in insertion order.
    pub fn put(&self, station_id: &str, reading: Reading) {
        let mut state = self.state.lock();
        insert_ordered(&mut state.ledgers, station_id, reading);
    }

    /// Copy of the station's ledger, oldest first.
    pub fn get(&self, station_id: &str) -> Option<Vec<Reading>> {
        self.state.lock().ledgers.get(station_id).cloned()
    }

    /// Records a write from `source_id` at `seen_at`, returning the previous time.
    pub fn record_source_seen(&self, source_id: &str, seen_at: WallClock) -> Option<WallClock> {
        self.state.lock().sources.insert(source_id.to_string(), seen_at)
    }

    /// `put` plus `record_source_seen` under one lock acquisition, so an
    /// eviction pass cannot slip in between the two.
    pub fn commit(&self, station_id: &str, reading: Reading, seen_at: WallClock) -> Option<WallClock> {
        let source_id = reading.source_id().to_string();
        let mut state = self.state.lock();
        insert_ordered(&mut state.ledgers, station_id, reading);
        state.sources.insert(source_id, seen_at)
    }

    /// Some station id currently held; the smallest, so repeated calls on
    /// an unchanged store agree.
    pub fn any_station_id(&self) -> Option<String> {
        self.state.lock().ledgers.keys().next().cloned()
    }

    /// Logical time of the newest reading held, across all stations.
    pub fn latest_logical_time(&self) -> Option<Timestamp> {
        self.state
            .lock()
            .ledgers
            .values()
            .filter_map(|ledger| ledger.last().map(Reading::logical_time))
            .max()
    }

    pub fn station_ids(&self) -> Vec<String> {
        self.state.lock().ledgers.keys().cloned().collect()
    }

    pub fn sources(&self) -> SourceTable {
        self.state.lock().sources.clone()
    }

    /// Total number of readings across all stations.
    pub fn len(&self) -> usize {
        self.state.lock().ledgers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ledgers.is_empty()
    }

    /// Drops every source silent for longer than `threshold` and all of its
    /// readings. Ledgers left empty are removed; once no source is live at
    /// all, every remaining ledger goes too.
    pub fn evict_stale(&self, now: WallClock, threshold: Duration) -> Eviction {
        let mut state = self.state.lock();
        let StoreState { ledgers, sources, .. } = &mut *state;

        let stale: Vec<String> = sources
            .iter()
            .filter(|(_, seen)| u128::from(now.saturating_sub(**seen)) > threshold.as_millis())
            .map(|(source, _)| source.clone())
            .collect();
        for source in &stale {
            sources.remove(source);
        }

        let mut eviction = Eviction {
            sources: stale.len(),
            ..Eviction::default()
        };
        let no_live_sources = sources.is_empty();
        ledgers.retain(|_, ledger| {
            let before = ledger.len();
            if no_live_sources {
                ledger.clear();
            } else if !stale.is_empty() {
                ledger.retain(|reading| !stale.iter().any(|s| s == reading.source_id()));
            }
            eviction.readings += before - ledger.len();
            if ledger.is_empty() {
                eviction.stations += 1;
                false
            } else {
                true
            }
        });
        eviction
    }

    /// Eviction pass against the wall clock and the configured threshold.
    pub fn evict_expired(&self) -> Eviction {
        let eviction = self.evict_stale(wall_clock_now(), self.config.staleness_threshold);
        if !eviction.is_empty() {
            info!(
                sources = eviction.sources,
                readings = eviction.readings,
                stations = eviction.stations,
                "evicted stale readings"
            );
        }
        eviction
    }

    /// Writes both snapshots. The in-memory state stays authoritative if this fails.
    pub fn persist(&self) -> Result<(), SnapshotError> {
        let _ordered = self.save_lock.lock();
        let (ledgers, sources) = {
            let state = self.state.lock();
            (state.ledgers.clone(), state.sources.clone())
        };
        self.ledger_file.save(&ledgers)?;
        self.sources_file.save(&sources)?;
        debug!(stations = ledgers.len(), sources = sources.len(), "persisted store snapshot");
        Ok(())
    }

    /// Replaces memory with the on-disk snapshots.
    ///
    /// Each file falls back to its backup; when both are missing or unusable
    /// the corresponding map starts empty.
    pub fn restore(&self) {
        let ledgers: Ledgers = load_or_empty(&self.ledger_file);
        let sources: SourceTable = load_or_empty(&self.sources_file);

        let mut state = self.state.lock();
        state.ledgers = ledgers
            .into_iter()
            .filter(|(_, ledger)| !ledger.is_empty())
            .map(|(station, mut ledger)| {
                ledger.sort_by_key(Reading::logical_time);
                (station, ledger)
            })
            .collect();
        state.sources = sources;
        state.cleared = false;
        info!(
            stations = state.ledgers.len(),
            sources = state.sources.len(),
            "restored store"
        );
    }

    /// Adds a replica to the reference count, starting background work on
    /// the first one. Returns the new count.
    pub fn register_replica(self: &Arc<Self>) -> Result<usize> {
        let mut background = self.background.lock();
        let (count, needs_restore) = {
            let mut state = self.state.lock();
            state.replicas += 1;
            (state.replicas, state.cleared)
        };
        if count == 1 {
            if needs_restore {
                self.restore();
            }
            if background.is_none() {
                match self.spawn_background() {
                    Ok(tasks) => *background = Some(tasks),
                    Err(err) => {
                        self.state.lock().replicas -= 1;
                        return Err(err);
                    }
                }
            }
        }
        Ok(count)
    }

    /// Removes a replica from the reference count. Returns `true` if it was
    /// the last one, in which case the store has been flushed and cleared.
    pub fn deregister_replica(&self) -> bool {
        let mut background = self.background.lock();
        let remaining = {
            let mut state = self.state.lock();
            if state.replicas == 0 {
                warn!("deregister called with no registered replicas");
                return false;
            }
            state.replicas -= 1;
            state.replicas
        };
        if remaining > 0 {
            return false;
        }

        if let Some(tasks) = background.take() {
            tasks.save.stop(self.config.shutdown_grace);
            tasks.evict.stop(self.config.shutdown_grace);
        }
        self.evict_expired();
        if let Err(err) = self.persist() {
            warn!(error = %err, "final snapshot failed");
        }

        let mut state = self.state.lock();
        state.ledgers.clear();
        state.sources.clear();
        state.cleared = true;
        info!("last replica left, store flushed and cleared");
        true
    }

    pub fn replica_count(&self) -> usize {
        self.state.lock().replicas
    }

    fn spawn_background(self: &Arc<Self>) -> Result<Background> {
        let weak = Arc::downgrade(self);
        let save = PeriodicTask::spawn("store-save", self.config.save_interval, move || {
            if let Some(store) = Weak::upgrade(&weak) {
                store.persist()?;
            }
            Ok(())
        })?;

        let weak = Arc::downgrade(self);
        let evict = PeriodicTask::spawn("store-evict", self.config.eviction_interval, move || {
            if let Some(store) = Weak::upgrade(&weak) {
                store.evict_expired();
            }
            Ok(())
        })?;

        Ok(Background { save, evict })
    }
}

fn insert_ordered(ledgers: &mut Ledgers, station_id: &str, reading: Reading) {
    let ledger = ledgers.entry(station_id.to_string()).or_default();
    let at = ledger.partition_point(|held| held.logical_time() <= reading.logical_time());
    ledger.insert(at, reading);
}

fn load_or_empty<T>(file: &SnapshotFile) -> T
where
    T: Default + serde::de::DeserializeOwned,
{
    match file.load() {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(err) => {
            warn!(error = %err, path = %file.primary().display(), "snapshot unreadable, starting empty");
            T::default()
        }
    }
}
