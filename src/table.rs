//! The mutable table: the in-memory ordered buffer that absorbs writes
//! before they are frozen into an SST.
//!
//! Grounded on the teacher's `StringMemtable` (size accounting, `put`/`get`/
//! `remove`, `flush_to_sstable`-style drain), but narrowed to the spec's
//! single-writer model: no `Arc<RwLock<_>>`, no background thread, plain
//! `&mut self` mutation owned exclusively by the level manager.

use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::sstable::DATA_PREFIX;

/// Per-entry index + length overhead charged against a run's projected size:
/// an 8-byte key and a 4-byte offset in the SST index.
pub const ENTRY_OVERHEAD: usize = 12;

/// Sentinel value denoting a deletion. Writing this value via `put` is what
/// `remove` does internally; external callers are expected to go through
/// `remove`/`del` rather than writing this literal themselves.
pub const TOMBSTONE: &[u8] = b"~DELETED~";

/// The largest single value `put` will accept for a store with the given
/// `max_table_size`: large enough that even the very first entry written to
/// an empty table could never overflow a freshly flushed SST.
pub fn max_value_len(max_table_size: usize) -> usize {
    max_table_size.saturating_sub(DATA_PREFIX + ENTRY_OVERHEAD)
}

/// A single stored key-value pair, as produced by [`MutableTable::drain_sorted`]
/// and consumed by the SST writer and merge engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: u64,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.value == TOMBSTONE
    }
}

/// An ordered in-memory index over `u64` keys.
#[derive(Debug)]
pub struct MutableTable {
    data: BTreeMap<u64, Vec<u8>>,
    /// Projected on-disk footprint if flushed right now.
    size: usize,
    max_table_size: usize,
}

impl MutableTable {
    pub fn new(max_table_size: usize) -> Self {
        MutableTable {
            data: BTreeMap::new(),
            size: DATA_PREFIX,
            max_table_size,
        }
    }

    pub fn get(&self, key: u64) -> Option<&[u8]> {
        self.data.get(&key).map(|v| v.as_slice())
    }

    /// Inserts or overwrites `key`. Returns whether the key existed
    /// beforehand. Rejects the write with [`StoreError::ValueTooLarge`]
    /// without mutating anything if `value` could never fit a fresh SST.
    pub fn put(&mut self, key: u64, value: Vec<u8>) -> Result<bool> {
        let limit = max_value_len(self.max_table_size);
        if value.len() > limit {
            return Err(StoreError::ValueTooLarge {
                size: value.len(),
                max: limit,
            });
        }

        match self.data.insert(key, value) {
            Some(old) => {
                let new_len = self.data[&key].len();
                self.size = self.size + new_len - old.len();
                Ok(true)
            }
            None => {
                let new_len = self.data[&key].len();
                self.size += ENTRY_OVERHEAD + new_len;
                Ok(false)
            }
        }
    }

    /// Equivalent to `put(key, TOMBSTONE)`. Returns whether a non-tombstone
    /// value was visible for `key` beforehand.
    pub fn remove(&mut self, key: u64) -> Result<bool> {
        let existed_live = matches!(self.data.get(&key), Some(v) if v.as_slice() != TOMBSTONE);
        self.put(key, TOMBSTONE.to_vec())?;
        Ok(existed_live)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Projected on-disk size if flushed right now.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.max_table_size
    }

    /// Consumes the table, yielding entries in ascending key order exactly
    /// once. `BTreeMap::into_iter` already walks in key order, so this is a
    /// direct adaptation rather than a sort.
    pub fn drain_sorted(self) -> impl Iterator<Item = Entry> {
        self.data
            .into_iter()
            .map(|(key, value)| Entry { key, value })
    }
}
