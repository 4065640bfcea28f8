//! The storage engine.
//!
//! Writes flow validate -> WAL append -> group-commit callback -> memtable
//! apply; the caller's future resolves only once its record (and every
//! record before it) is fsynced, so an acknowledged write survives a
//! crash. Reads snapshot the live memtable, the frozen memtable and the
//! SST list under a read lock, then query them in that order; across SSTs
//! the version with the greatest user timestamp wins, and a deletion
//! tombstone reads as absent.
//!
//! Background tasks flush frozen memtables into SSTs (publishing them
//! through the descriptor, then releasing covered WAL segments) and merge
//! the SST set back down once it grows past the compaction threshold.

pub(crate) mod compaction;
pub(crate) mod flush;
mod tasks;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Options;
use crate::descriptor::Descriptor;
use crate::errinput;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::sstable::table::BlockCache;
use crate::{sstable, wal};

/// Largest allowed key, in bytes.
pub const MAX_KEY_SIZE: usize = 4 * 1024;
/// Largest allowed value, in bytes.
pub const MAX_VALUE_SIZE: usize = 512 * 1024;

/// The table stack a read consults, newest first.
pub(crate) struct Tables {
    pub memtable: Arc<Memtable>,
    pub imemtable: Option<Arc<Memtable>>,
    pub ssts: Vec<Arc<sstable::Reader>>,
}

/// State shared between the engine API and its background tasks.
pub(crate) struct Shared {
    pub opts: Options,
    pub tables: RwLock<Tables>,
    pub descriptor: Mutex<Descriptor>,
    pub cache: Option<Arc<BlockCache>>,
    pub clock: Clock,
}

impl Shared {
    /// Applies a durable log record to the live memtable. Runs inside the
    /// WAL commit callback, so records arrive in sequence order.
    pub fn apply(&self, record: &wal::Record) {
        let value = match &record.mutation.op {
            wal::Op::Put(v) => Some(v.clone()),
            wal::Op::Delete => None,
        };
        let needs_freeze = {
            let tables = self.tables.read().expect("engine lock poisoned");
            tables.memtable.insert(
                record.sequence,
                &record.mutation.key,
                record.mutation.timestamp,
                value,
            );
            tables.memtable.size_bytes() > self.opts.memtable_flush_size
                && tables.imemtable.is_none()
        };
        if needs_freeze {
            self.freeze_memtable(false);
        }
    }

    /// Swaps the live memtable for a fresh one, leaving the old one frozen
    /// for the flush task. Without `force`, only swaps once the memtable
    /// exceeds the flush threshold. No-op while a frozen memtable exists.
    pub fn freeze_memtable(&self, force: bool) -> bool {
        let mut tables = self.tables.write().expect("engine lock poisoned");
        if tables.imemtable.is_some() || tables.memtable.is_empty() {
            return false;
        }
        if !force && tables.memtable.size_bytes() <= self.opts.memtable_flush_size {
            return false;
        }
        let upper = tables.memtable.sequence_upper();
        let old = std::mem::replace(&mut tables.memtable, Arc::new(Memtable::new(upper)));
        tracing::info!(
            size = old.size_bytes(),
            sequence_upper = upper,
            "froze memtable"
        );
        tables.imemtable = Some(old);
        true
    }
}

/// Issues strictly increasing microsecond timestamps, never behind either
/// the system clock or any timestamp observed during recovery.
pub(crate) struct Clock {
    last: AtomicI64,
}

impl Clock {
    fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    pub fn observe(&self, timestamp: i64) {
        self.last.fetch_max(timestamp, Ordering::SeqCst);
    }

    pub fn next_micros(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_micros() as i64;
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}

/// Timestamp-named SST files sort by creation time.
pub(crate) fn sst_filename() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    format!("{nanos:020}.sst")
}

/// A snapshot of engine state for monitoring and tests.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub memtable_size: u64,
    pub frozen_memtable: bool,
    pub sst_count: usize,
    pub next_sequence: i64,
    pub descriptor_version: i64,
}

/// A single-node ordered key-value storage engine.
pub struct Engine {
    shared: Arc<Shared>,
    wal: Arc<wal::Writer>,
    maintenance: tasks::Maintenance,
}

impl Engine {
    /// Opens (or creates) the database described by `opts`, recovering any
    /// state left by a previous process. Corruption in the descriptor or
    /// in a WAL record aborts the open.
    pub async fn open(opts: Options) -> Result<Engine> {
        std::fs::create_dir_all(&opts.descriptor_dir)?;
        std::fs::create_dir_all(&opts.sst_dir)?;
        std::fs::create_dir_all(&opts.log_dir)?;

        let descriptor = match Descriptor::load(&opts.descriptor_dir)? {
            Some(d) => d,
            None => {
                tracing::info!("no descriptor found, creating new database");
                Descriptor::create(&opts.descriptor_dir)
            }
        };

        let cache =
            (opts.block_cache_size > 0).then(|| Arc::new(BlockCache::new(opts.block_cache_size)));

        let mut ssts = Vec::new();
        let mut last_applied = 0i64;
        for meta in &descriptor.current.sst_meta {
            last_applied = last_applied.max(meta.applied_until);
            let path = opts.sst_dir.join(&meta.filename);
            ssts.push(Arc::new(sstable::Reader::open(&path, cache.clone())?));
        }

        let memtable = Arc::new(Memtable::new(last_applied));
        let clock = Clock::new();

        // Replay WAL records not yet covered by an SST.
        let mut scanned = 0u64;
        let mut applied = 0u64;
        let mut sequence = last_applied;
        for record in wal::Scanner::open(&opts.log_dir)? {
            let record = record?;
            scanned += 1;
            if record.sequence <= sequence {
                continue;
            }
            sequence = record.sequence;
            applied += 1;
            clock.observe(record.mutation.timestamp);
            let value = match record.mutation.op {
                wal::Op::Put(v) => Some(v),
                wal::Op::Delete => None,
            };
            memtable.insert(
                record.sequence,
                &record.mutation.key,
                record.mutation.timestamp,
                value,
            );
        }
        tracing::info!(scanned, applied, last_sequence = sequence, "recovered log");

        let wal = Arc::new(wal::Writer::open(
            &opts.log_dir,
            sequence + 1,
            opts.target_log_size,
        )?);

        let shared = Arc::new(Shared {
            opts,
            tables: RwLock::new(Tables {
                memtable,
                imemtable: None,
                ssts,
            }),
            descriptor: Mutex::new(descriptor),
            cache,
            clock,
        });

        // Recovery may have overfilled the memtable.
        shared.freeze_memtable(false);

        let maintenance = tasks::Maintenance::start(&shared);

        Ok(Engine {
            shared,
            wal,
            maintenance,
        })
    }

    /// Writes `value` under `key`, returning the assigned timestamp once
    /// the mutation is durable.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<i64> {
        validate_key(key)?;
        validate_value(value)?;
        self.write(key.to_vec(), wal::Op::Put(value.to_vec())).await
    }

    /// Records a deletion of `key`, returning the assigned timestamp once
    /// the tombstone is durable.
    pub async fn delete(&self, key: &[u8]) -> Result<i64> {
        validate_key(key)?;
        self.write(key.to_vec(), wal::Op::Delete).await
    }

    async fn write(&self, key: Vec<u8>, op: wal::Op) -> Result<i64> {
        let timestamp = self.shared.clock.next_micros();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let shared = Arc::clone(&self.shared);
        self.wal.append(
            wal::Mutation { key, timestamp, op },
            Box::new(move |result| {
                let out = result.map(|record| {
                    shared.apply(&record);
                    record.mutation.timestamp
                });
                // A caller that stopped waiting does not undo the write.
                let _ = tx.send(out);
            }),
        )?;
        rx.await
            .map_err(|_| Error::Io("wal writer dropped the write".into()))?
    }

    /// Returns the newest value for `key`, or `None` if the key is absent
    /// or deleted.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;

        let (memtable, imemtable, ssts) = {
            let tables = self.shared.tables.read().expect("engine lock poisoned");
            (
                tables.memtable.clone(),
                tables.imemtable.clone(),
                tables.ssts.clone(),
            )
        };

        if let Some(cell) = memtable.find(key) {
            return Ok(cell);
        }
        if let Some(imemtable) = &imemtable {
            if let Some(cell) = imemtable.find(key) {
                return Ok(cell);
            }
        }

        let mut value = None;
        let mut value_ts = i64::MIN;
        for sst in &ssts {
            if let Some((cell, timestamp)) = sst.find(key)? {
                if timestamp > value_ts {
                    value = cell;
                    value_ts = timestamp;
                }
            }
        }
        Ok(value)
    }

    /// Freezes the live memtable (if possible) and flushes it to an SST.
    /// Returns whether anything was flushed.
    pub async fn flush(&self) -> Result<bool> {
        self.shared.freeze_memtable(true);
        flush::flush_frozen_memtable(&self.shared)
    }

    /// Merges all live SSTs into one, regardless of the compaction
    /// threshold. A no-op with fewer than two SSTs.
    pub async fn compact(&self) -> Result<()> {
        let inputs = {
            let tables = self.shared.tables.read().expect("engine lock poisoned");
            tables.ssts.clone()
        };
        if inputs.len() < 2 {
            return Ok(());
        }
        compaction::compact(&self.shared, inputs)
    }

    pub fn metrics(&self) -> Metrics {
        // Descriptor before tables, matching the flush and compaction
        // lock order; released before the tables lock is taken.
        let descriptor_version = self
            .shared
            .descriptor
            .lock()
            .expect("descriptor poisoned")
            .version();
        let tables = self.shared.tables.read().expect("engine lock poisoned");
        Metrics {
            memtable_size: tables.memtable.size_bytes(),
            frozen_memtable: tables.imemtable.is_some(),
            sst_count: tables.ssts.len(),
            next_sequence: self.wal.next_sequence(),
            descriptor_version,
        }
    }

    /// Stops background tasks, drains the WAL writer and syncs. Buffered
    /// state is not flushed to SSTs; the log recovers it on reopen.
    pub async fn close(self) -> Result<()> {
        tracing::info!("closing engine");
        self.maintenance.stop().await?;
        self.wal.close()
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(errinput!("key cannot be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(errinput!("key must be <= {MAX_KEY_SIZE} bytes"));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(errinput!("value must be <= {MAX_VALUE_SIZE} bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_options(dir: &std::path::Path) -> Options {
        Options::new(dir)
            .memtable_flush_size(1024)
            .block_cache_size(1 << 20)
            .flush_interval(Duration::from_millis(10))
            .compaction_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_set_get_delete() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(Options::new(dir.path())).await?;

        let ts1 = engine.set(b"key1", b"value1").await?;
        engine.set(b"key2", b"value2").await?;
        assert_eq!(engine.get(b"key1").await?, Some(b"value1".to_vec()));
        assert_eq!(engine.get(b"key2").await?, Some(b"value2".to_vec()));
        assert_eq!(engine.get(b"missing").await?, None);

        let ts2 = engine.set(b"key1", b"updated").await?;
        assert!(ts2 > ts1, "timestamps must be strictly increasing");
        assert_eq!(engine.get(b"key1").await?, Some(b"updated".to_vec()));

        engine.delete(b"key1").await?;
        assert_eq!(engine.get(b"key1").await?, None);
        assert_eq!(engine.get(b"key2").await?, Some(b"value2".to_vec()));

        engine.close().await
    }

    #[tokio::test]
    async fn test_validation() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(Options::new(dir.path())).await?;

        assert!(matches!(
            engine.set(b"", b"v").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.get(b"").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.set(&vec![b'k'; MAX_KEY_SIZE + 1], b"v").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.set(b"k", &vec![0u8; MAX_VALUE_SIZE + 1]).await,
            Err(Error::InvalidArgument(_))
        ));
        // Boundary sizes are accepted.
        engine
            .set(&vec![b'k'; MAX_KEY_SIZE], &vec![0u8; MAX_VALUE_SIZE])
            .await?;
        engine.set(b"k", b"").await?;
        assert_eq!(engine.get(b"k").await?, Some(Vec::new()));

        engine.close().await
    }

    #[tokio::test]
    async fn test_reads_survive_flush() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).await?;

        engine.set(b"k", b"v1").await?;
        engine.set(b"k", b"v2").await?;
        assert!(engine.flush().await?);
        assert_eq!(engine.metrics().sst_count, 1);
        assert_eq!(engine.metrics().memtable_size, 0);

        // The SST serves the newest version.
        assert_eq!(engine.get(b"k").await?, Some(b"v2".to_vec()));

        // A fresh write shadows the flushed one.
        engine.set(b"k", b"v3").await?;
        assert_eq!(engine.get(b"k").await?, Some(b"v3".to_vec()));

        engine.close().await
    }

    #[tokio::test]
    async fn test_durability_across_restart() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();

        let engine = Engine::open(test_options(dir.path())).await?;
        for i in 0..300u32 {
            let key = format!("key{i:04}");
            let value = format!("value{i:04}-{}", "x".repeat(32));
            engine.set(key.as_bytes(), value.as_bytes()).await?;
        }
        engine.delete(b"key0100").await?;
        engine.close().await?;

        let engine = Engine::open(test_options(dir.path())).await?;
        for i in 0..300u32 {
            let key = format!("key{i:04}");
            let got = engine.get(key.as_bytes()).await?;
            if i == 100 {
                assert_eq!(got, None, "deleted key resurfaced after restart");
            } else {
                let want = format!("value{i:04}-{}", "x".repeat(32));
                assert_eq!(got, Some(want.into_bytes()), "lost {key} after restart");
            }
        }
        engine.close().await
    }

    #[tokio::test]
    async fn test_tombstone_survives_flush_and_compaction() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).await?;

        engine.set(b"doomed", b"v").await?;
        engine.set(b"keeper", b"v").await?;
        assert!(engine.flush().await?);

        engine.delete(b"doomed").await?;
        assert!(engine.flush().await?);
        assert_eq!(engine.metrics().sst_count, 2);

        engine.compact().await?;
        assert_eq!(engine.metrics().sst_count, 1);

        assert_eq!(engine.get(b"doomed").await?, None);
        assert_eq!(engine.get(b"keeper").await?, Some(b"v".to_vec()));

        // Still deleted after a restart of the compacted state.
        engine.close().await?;
        let engine = Engine::open(test_options(dir.path())).await?;
        assert_eq!(engine.get(b"doomed").await?, None);
        assert_eq!(engine.get(b"keeper").await?, Some(b"v".to_vec()));
        engine.close().await
    }

    #[tokio::test]
    async fn test_compaction_keeps_newest_version() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_options(dir.path())).await?;

        engine.set(b"k", b"old").await?;
        assert!(engine.flush().await?);
        engine.set(b"k", b"new").await?;
        assert!(engine.flush().await?);
        engine.compact().await?;

        assert_eq!(engine.metrics().sst_count, 1);
        assert_eq!(engine.get(b"k").await?, Some(b"new".to_vec()));
        engine.close().await
    }

    #[tokio::test]
    async fn test_background_flush_and_compaction() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let opts = test_options(dir.path()).compaction_sst_count(2);
        let engine = Engine::open(opts).await?;

        // Write well past the 1KiB flush threshold and give the background
        // tasks time to flush and then fold the SSTs back down.
        for i in 0..200u32 {
            let key = format!("key{i:04}");
            engine.set(key.as_bytes(), &[0u8; 128]).await?;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let metrics = engine.metrics();
        assert!(metrics.sst_count >= 1, "background flush never ran");
        assert!(
            metrics.sst_count <= 2,
            "compactor left {} ssts",
            metrics.sst_count
        );
        for i in 0..200u32 {
            let key = format!("key{i:04}");
            assert_eq!(engine.get(key.as_bytes()).await?, Some(vec![0u8; 128]));
        }
        engine.close().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::open(test_options(dir.path())).await?);

        let mut handles = Vec::new();
        for t in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                for i in 0..100u32 {
                    let key = format!("w{t}-key{i:03}");
                    engine.set(key.as_bytes(), key.as_bytes()).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await?;
        }

        for t in 0..8 {
            for i in 0..100u32 {
                let key = format!("w{t}-key{i:03}");
                assert_eq!(
                    engine.get(key.as_bytes()).await?,
                    Some(key.clone().into_bytes())
                );
            }
        }

        let engine = Arc::try_unwrap(engine).unwrap_or_else(|_| panic!("engine still shared"));
        engine.close().await
    }

    #[tokio::test]
    async fn test_reopen_empty_database() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        Engine::open(Options::new(dir.path())).await?.close().await?;

        let engine = Engine::open(Options::new(dir.path())).await?;
        assert_eq!(engine.get(b"anything").await?, None);
        engine.set(b"k", b"v").await?;
        assert_eq!(engine.get(b"k").await?, Some(b"v".to_vec()));
        engine.close().await
    }

    #[tokio::test]
    async fn test_wal_segments_released_after_flush() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        // Tiny segments so writes roll over quickly; background flush held
        // off so the explicit flush below does the releasing.
        let opts = test_options(dir.path())
            .target_log_size(512)
            .flush_interval(Duration::from_secs(3600));
        let engine = Engine::open(opts).await?;

        for i in 0..100u32 {
            let key = format!("key{i:04}");
            engine.set(key.as_bytes(), &[7u8; 64]).await?;
        }
        let segments_before = std::fs::read_dir(dir.path().join("log"))?.count();
        assert!(segments_before > 1, "expected rollover");

        assert!(engine.flush().await?);
        let segments_after = std::fs::read_dir(dir.path().join("log"))?.count();
        assert!(
            segments_after < segments_before,
            "flush should release covered wal segments ({segments_before} -> {segments_after})"
        );

        engine.close().await
    }
}
