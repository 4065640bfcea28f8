//! Frozen-memtable flush.

use std::sync::Arc;

use crate::descriptor::SstMeta;
use crate::error::Result;
use crate::{sstable, wal};

use super::{sst_filename, Shared};

/// Writes the frozen memtable (if any) out as an SST, publishes it through
/// the descriptor, drops the frozen memtable and releases WAL segments the
/// new SST now covers. Returns whether anything was flushed.
///
/// Runs on the flush task; an error here means durability can no longer be
/// guaranteed and the caller aborts the process.
pub(crate) fn flush_frozen_memtable(shared: &Shared) -> Result<bool> {
    let memtable = {
        let tables = shared.tables.read().expect("engine lock poisoned");
        tables.imemtable.clone()
    };
    let Some(memtable) = memtable else {
        return Ok(false);
    };

    let filename = sst_filename();
    let path = shared.opts.sst_dir.join(&filename);
    tracing::info!(
        size = memtable.size_bytes(),
        path = %path.display(),
        "flushing memtable"
    );

    let mut writer = sstable::Writer::create(&path)?;
    for row in memtable.iter() {
        let row = row?;
        writer.append(&row.key, row.timestamp, row.value.as_deref())?;
    }
    writer.finish()?;

    let reader = Arc::new(sstable::Reader::open(&path, shared.cache.clone())?);
    let applied_until = memtable.sequence_upper();

    // Commit point: the descriptor save makes the SST authoritative, after
    // which the frozen memtable and covered WAL segments are redundant.
    let watermark = {
        let mut descriptor = shared.descriptor.lock().expect("descriptor poisoned");
        descriptor.current.sst_meta.push(SstMeta {
            filename,
            applied_until,
        });
        descriptor.save()?;
        let watermark = descriptor.max_applied();

        let mut tables = shared.tables.write().expect("engine lock poisoned");
        tables.ssts.push(reader);
        tables.imemtable = None;
        watermark
    };
    tracing::info!(applied_until, "flush completed");

    wal::remove_applied_segments(&shared.opts.log_dir, watermark);
    Ok(true)
}
