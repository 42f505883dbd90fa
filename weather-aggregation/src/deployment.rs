//! State shared by every replica of one deployment.

use std::sync::Arc;

use anyhow::Result;

use crate::clock::LamportClock;
use crate::config::StoreConfig;
use crate::store::ReadingStore;

/// The store and shared clock that a group of replicas have in common.
///
/// Cloning is cheap and yields a handle onto the same store and clock.
/// Nothing here is global: two deployments in one process are fully
/// independent, which is how the tests run clusters side by side.
#[derive(Clone)]
pub struct Deployment {
    store: Arc<ReadingStore>,
    shared_clock: Arc<LamportClock>,
}

impl Deployment {
    /// Opens the store under `config.data_dir` with a fresh shared clock.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Ok(Self::new(ReadingStore::open(config)?, Arc::new(LamportClock::new())))
    }

    pub fn new(store: Arc<ReadingStore>, shared_clock: Arc<LamportClock>) -> Self {
        Self {
            store,
            shared_clock,
        }
    }

    pub fn store(&self) -> &Arc<ReadingStore> {
        &self.store
    }

    pub fn shared_clock(&self) -> &Arc<LamportClock> {
        &self.shared_clock
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn clones_share_store_and_clock() {
        let dir = TempDir::new().unwrap();
        let deployment = Deployment::open(StoreConfig::new(dir.path())).unwrap();
        let other = deployment.clone();

        other.shared_clock().tick();
        assert_eq!(deployment.shared_clock().value(), 1);
        assert!(Arc::ptr_eq(deployment.store(), other.store()));
    }
}
