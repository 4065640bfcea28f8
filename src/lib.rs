//! EmberDB: a single-node, ordered key-value storage engine.
//!
//! The engine is a log-structured merge tree. Every acknowledged write is
//! durable in the write-ahead log before the caller sees success; recent
//! writes live in a concurrent skiplist memtable; older data resides in
//! immutable sorted-string-table files with prefix-compressed blocks,
//! Bloom filters and a shared block cache. A persisted descriptor names
//! the live SSTs, and background tasks flush frozen memtables and compact
//! the SST set.
//!
//! ```text
//!  set/delete ──> WAL (group commit, fsync) ──> memtable ──┐ freeze
//!                                                          ▼
//!  get ──> memtable ──> frozen memtable ──> SSTs    frozen memtable
//!                      (newest timestamp wins)             │ flush
//!                                                          ▼
//!                        descriptor <── compaction <── SST files
//! ```
//!
//! Rows are multi-versioned: each carries the caller-visible microsecond
//! timestamp assigned at write time, and every on-disk structure orders by
//! (key ascending, timestamp descending) via the order-preserving key
//! encoding in [`encoding`], so point reads naturally meet the newest
//! version first.

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod memtable;
pub mod merge;
pub mod sstable;
pub mod wal;

pub use config::Options;
pub use engine::Engine;
pub use error::{Error, Result};
