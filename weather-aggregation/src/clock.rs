//! Lamport logical clock shared between replicas.
//!
//! Every replica owns a local clock and synchronizes it against one shared
//! clock handed out by the [`Deployment`](crate::deployment::Deployment).
//! All operations are lock-free; `receive` uses a compare-and-swap loop so
//! concurrent connections racing on the same counter still produce a value
//! consistent with some serial order of their calls.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Logical timestamp carried in `LamportClock` headers.
///
/// Signed because peers that have no clock yet announce `-1`.
pub type Timestamp = i64;

/// Largest timestamp accepted from a peer.
///
/// Leaves headroom so local ticks past a received value never reach
/// `i64::MAX`; arithmetic saturates there regardless.
pub const MAX_TIMESTAMP: Timestamp = i64::MAX / 2;

/// Lamport clock backed by a single atomic counter.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicI64,
}

impl LamportClock {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a clock starting at `time`.
    pub fn starting_at(time: Timestamp) -> Self {
        Self {
            time: AtomicI64::new(time),
        }
    }

    /// Advances the clock for a local event.
    pub fn tick(&self) {
        self.advance();
    }

    /// Advances the clock and returns the value to stamp an outgoing message with.
    pub fn send(&self) -> Timestamp {
        self.advance().saturating_add(1)
    }

    /// Adds one, saturating, and returns the previous value.
    fn advance(&self) -> Timestamp {
        match self
            .time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |time| Some(time.saturating_add(1)))
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Folds a peer's timestamp into this clock.
    ///
    /// If the peer is not behind us the clock jumps to `peer + 1`; if we are
    /// already ahead of the peer the call leaves the clock untouched, so
    /// replaying the same timestamp is a no-op. Afterwards `value() > peer`
    /// holds for any `peer` below `i64::MAX`.
    pub fn receive(&self, peer: Timestamp) {
        let mut current = self.time.load(Ordering::Acquire);
        loop {
            if peer < current {
                return;
            }
            match self.time.compare_exchange_weak(
                current,
                peer.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns the current value without advancing it.
    pub fn value(&self) -> Timestamp {
        self.time.load(Ordering::Acquire)
    }

    /// Forces the clock to `time`.
    ///
    /// This can move the clock backwards and break causal ordering. It is
    /// only used when the last replica of a deployment shuts down and the
    /// shared clock goes back to its initial value.
    pub fn reset(&self, time: Timestamp) {
        self.time.store(time, Ordering::Release);
    }

    /// Adopts `shared`'s value if it is ahead, without ticking.
    pub fn catch_up(&self, shared: &LamportClock) -> Timestamp {
        let previous = self.time.fetch_max(shared.value(), Ordering::AcqRel);
        previous.max(shared.value())
    }

    /// Synchronizes this (local) clock with the deployment's shared clock.
    ///
    /// Adopts the shared value if it is ahead, pushes our value back into the
    /// shared clock, then ticks locally so the next stamp is strictly newer.
    pub fn sync_with(&self, shared: &LamportClock) {
        self.time.fetch_max(shared.value(), Ordering::AcqRel);
        shared.receive(self.value());
        self.tick();
    }
}

impl fmt::Display for LamportClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LamportClock[time={}]", self.value())
    }
}
