use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding SST files.
    pub sst_dir: PathBuf,

    /// Directory holding WAL segments.
    pub log_dir: PathBuf,

    /// Directory holding descriptor files.
    pub descriptor_dir: PathBuf,

    /// Live-memtable size threshold triggering freeze + flush (default: 16MB).
    pub memtable_flush_size: u64,

    /// Per-WAL-segment rollover threshold (default: 8MB).
    pub target_log_size: u64,

    /// Capacity of the shared block cache in bytes. 0 disables the cache.
    pub block_cache_size: u64,

    /// SST count above which the compactor merges everything (default: 8).
    pub compaction_sst_count: usize,

    /// How often the flush task checks for a frozen memtable (default: 50ms).
    pub flush_interval: Duration,

    /// How often the compactor checks the SST count (default: 1s).
    pub compaction_interval: Duration,
}

impl Options {
    /// Create options rooted at the given base directory, with SSTs under
    /// `<base>/sst`, WAL segments under `<base>/log` and descriptors at the
    /// base itself.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base = base_dir.into();
        Self {
            sst_dir: base.join("sst"),
            log_dir: base.join("log"),
            descriptor_dir: base,
            memtable_flush_size: 16 * 1024 * 1024,
            target_log_size: 8 * 1024 * 1024,
            block_cache_size: 32 * 1024 * 1024,
            compaction_sst_count: 8,
            flush_interval: Duration::from_millis(50),
            compaction_interval: Duration::from_secs(1),
        }
    }

    /// Set the memtable flush threshold.
    pub fn memtable_flush_size(mut self, size: u64) -> Self {
        self.memtable_flush_size = size;
        self
    }

    /// Set the WAL segment rollover threshold.
    pub fn target_log_size(mut self, size: u64) -> Self {
        self.target_log_size = size;
        self
    }

    /// Set the block cache capacity. 0 disables the cache.
    pub fn block_cache_size(mut self, size: u64) -> Self {
        self.block_cache_size = size;
        self
    }

    /// Set the compaction SST count threshold.
    pub fn compaction_sst_count(mut self, count: usize) -> Self {
        self.compaction_sst_count = count;
        self
    }

    /// Set the flush check interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the compaction check interval.
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }
}
