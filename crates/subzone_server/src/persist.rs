//! The persistence contract: opaque blobs per (key, interval, arena).
//!
//! The real store (a database module) is external; the core and the game
//! modules call through [`PersistentStorage`] when it is registered on the
//! broker, and carry on without persistence when it is not.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// How long a record lives.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PersistInterval {
    /// Survives everything.
    Forever,
    /// Cleared when the flag/ball game resets.
    Game,
    /// Cleared on a stats reset.
    Reset,
}

/// Blob storage. Implementations are called from the worker pool; they may
/// block.
pub trait PersistentStorage: Send + Sync {
    fn get(&self, key: u32, interval: PersistInterval, arena: Option<&str>) -> Option<Vec<u8>>;

    fn put(&self, key: u32, interval: PersistInterval, arena: Option<&str>, blob: &[u8]);

    fn clear(&self, key: u32, interval: PersistInterval, arena: Option<&str>);
}

/// In-memory storage for tests.
#[derive(Default)]
pub struct MemoryPersist {
    blobs: RwLock<FxHashMap<(u32, PersistInterval, Option<String>), Vec<u8>>>,
}

impl MemoryPersist {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStorage for MemoryPersist {
    fn get(&self, key: u32, interval: PersistInterval, arena: Option<&str>) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .get(&(key, interval, arena.map(str::to_owned)))
            .cloned()
    }

    fn put(&self, key: u32, interval: PersistInterval, arena: Option<&str>, blob: &[u8]) {
        self.blobs
            .write()
            .insert((key, interval, arena.map(str::to_owned)), blob.to_vec());
    }

    fn clear(&self, key: u32, interval: PersistInterval, arena: Option<&str>) {
        self.blobs
            .write()
            .remove(&(key, interval, arena.map(str::to_owned)));
    }
}
