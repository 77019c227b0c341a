//! An ordered, persistent key-value store built on a log-structured
//! merge-tree.
//!
//! This crate is a library: it does not parse command lines or
//! configuration files, and it carries no write-ahead log of its own.
//! Calling code is responsible for framing requests, wiring configuration,
//! and choosing whether writes need to be durable beyond what the SST files
//! on disk already provide. See [`Store`] for the operations this crate
//! exposes.

pub mod error;
pub mod filter;
pub mod level;
pub mod merge;
pub mod sstable;
pub mod table;

pub use error::{Result, StoreError};
use level::LevelManager;
use std::path::Path;
use table::TOMBSTONE;

/// The store's public handle. Wraps a [`LevelManager`] and enforces the one
/// rule that belongs to the façade rather than the engine: a caller may
/// never `put` the tombstone sentinel directly, since doing so would make a
/// legitimately stored value indistinguishable from a deletion.
pub struct Store {
    manager: LevelManager,
}

impl Store {
    /// Opens (or recovers) a store rooted at `dir`, creating it if absent.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Store {
            manager: LevelManager::open(dir)?,
        })
    }

    /// Opens a store with an explicit cap on a single run's on-disk size.
    /// Mainly useful for tests that want to exercise flush and compaction
    /// without writing megabytes of fixture data.
    pub fn open_with_max_table_size(dir: impl AsRef<Path>, max_table_size: usize) -> Result<Self> {
        Ok(Store {
            manager: LevelManager::open_with_max_table_size(dir, max_table_size)?,
        })
    }

    /// Inserts or overwrites `key`. Rejects `value` equal to the reserved
    /// tombstone sentinel with [`StoreError::ReservedValue`].
    pub fn put(&mut self, key: u64, value: Vec<u8>) -> Result<()> {
        if value == TOMBSTONE {
            return Err(StoreError::ReservedValue);
        }
        self.manager.put(key, value)
    }

    /// Reads the current value of `key`, or `None` if absent or deleted.
    pub fn get(&mut self, key: u64) -> Result<Option<Vec<u8>>> {
        self.manager.get(key)
    }

    /// Deletes `key`. Returns whether a non-tombstone value was visible for
    /// `key` immediately beforehand.
    pub fn del(&mut self, key: u64) -> Result<bool> {
        self.manager.del(key)
    }

    /// Drops every key and SST file, returning the store to its just-opened,
    /// empty state.
    pub fn reset(&mut self) -> Result<()> {
        self.manager.reset()
    }

    /// Flushes any buffered writes. Files and caches are released when the
    /// store is dropped.
    pub fn close(&mut self) -> Result<()> {
        self.manager.close()
    }

    pub fn is_poisoned(&self) -> bool {
        self.manager.is_poisoned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_rejects_the_tombstone_sentinel() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let err = store.put(1, TOMBSTONE.to_vec()).unwrap_err();
        assert!(matches!(err, StoreError::ReservedValue));
    }

    #[test]
    fn open_put_get_close_reopen_round_trips() {
        let dir = tempdir().unwrap();
        {
            let mut store = Store::open(dir.path()).unwrap();
            store.put(1, b"hello".to_vec()).unwrap();
            store.put(2, b"world".to_vec()).unwrap();
            store.del(2).unwrap();
            store.close().unwrap();
        }
        let mut reopened = Store::open(dir.path()).unwrap();
        assert_eq!(reopened.get(1).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(reopened.get(2).unwrap(), None);
    }
}
