//! In-memory table of recent mutations.
//!
//! The memtable maps the engine's composite row key (key ascending,
//! timestamp descending) to the mutation's value cell, so the first entry
//! at or after a key's encoded prefix is always its newest version. It is
//! backed by a concurrent skiplist: writers publish nodes with release
//! stores and readers traverse with acquire loads, so `find` never takes a
//! lock and never observes a partially linked node. The engine serializes
//! writers through the WAL commit callback; readers run at any time.

use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::encoding;
use crate::error::Result;
use crate::merge::Row;

// Per-entry bookkeeping charge covering node and tower overhead.
const ENTRY_OVERHEAD: u64 = 64;

#[derive(Debug)]
struct Version {
    sequence: i64,
    value: Option<Vec<u8>>,
}

/// A sorted in-memory table of (key, timestamp) -> value cell.
pub struct Memtable {
    data: SkipMap<Vec<u8>, Version>,
    size: AtomicU64,
    /// Largest log sequence number applied to this memtable. The memtable
    /// covers the LSN window (lower bound at creation, sequence_upper].
    sequence_upper: AtomicI64,
}

impl Memtable {
    /// Creates an empty memtable whose LSN window starts just above
    /// `sequence_upper`.
    pub fn new(sequence_upper: i64) -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicU64::new(0),
            sequence_upper: AtomicI64::new(sequence_upper),
        }
    }

    /// Inserts a mutation. `value` of `None` records a deletion tombstone.
    pub fn insert(&self, sequence: i64, key: &[u8], timestamp: i64, value: Option<Vec<u8>>) {
        let entry_size =
            key.len() as u64 + value.as_ref().map_or(0, |v| v.len() as u64) + ENTRY_OVERHEAD;
        self.data
            .insert(encoding::encode_key(key, timestamp), Version { sequence, value });
        self.size.fetch_add(entry_size, Ordering::Relaxed);
        self.sequence_upper.fetch_max(sequence, Ordering::Relaxed);
    }

    /// Returns the newest value cell for `key`: `None` if the key has no
    /// version here, `Some(None)` if its newest version is a tombstone.
    pub fn find(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let prefix = encoding::encode_key_prefix(key);
        let entry = self.data.lower_bound(Bound::Included(prefix.as_slice()))?;
        if !entry.key().starts_with(&prefix) {
            return None;
        }
        Some(entry.value().value.clone())
    }

    /// Approximate memory charged to this memtable.
    pub fn size_bytes(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Largest LSN applied, or the creation watermark if untouched.
    pub fn sequence_upper(&self) -> i64 {
        self.sequence_upper.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates all rows in (key asc, timestamp desc) order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.data.iter(),
        }
    }
}

/// Forward iterator over decoded memtable rows.
pub struct Iter<'a> {
    inner: crossbeam_skiplist::map::Iter<'a, Vec<u8>, Version>,
}

impl Iterator for Iter<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(encoding::decode_key(entry.key()).map(|(key, timestamp)| Row {
            key,
            timestamp,
            value: entry.value().value.clone(),
        }))
    }
}
