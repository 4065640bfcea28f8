//! SST compaction.
//!
//! A single-level, size-triggered scheme: once the SST count passes the
//! configured threshold, every live SST is merged into one. All versions
//! are carried over, newest first per key, so point reads behave exactly
//! as before and history remains available.

use std::collections::HashSet;
use std::sync::Arc;

use crate::descriptor::SstMeta;
use crate::error::Result;
use crate::merge::{MergingIter, RowIter};
use crate::sstable;

use super::{sst_filename, Shared};

/// Merges all SSTs into one if the count exceeds the threshold.
pub(crate) fn maybe_compact(shared: &Shared) -> Result<()> {
    let inputs = {
        let tables = shared.tables.read().expect("engine lock poisoned");
        tables.ssts.clone()
    };
    if inputs.len() <= shared.opts.compaction_sst_count {
        return Ok(());
    }
    compact(shared, inputs)
}

/// Merges `inputs` into a single SST and swaps it into the descriptor,
/// leaving any SST flushed meanwhile untouched. The inputs are marked
/// obsolete; each file disappears once its outstanding reads drain.
///
/// Runs on the compaction task; an error here aborts the process.
pub(crate) fn compact(shared: &Shared, inputs: Vec<Arc<sstable::Reader>>) -> Result<()> {
    tracing::info!(inputs = inputs.len(), "compacting ssts");

    let mut sources: Vec<RowIter> = Vec::with_capacity(inputs.len());
    for sst in &inputs {
        sources.push(Box::new(sst.iter()?));
    }
    let merged = MergingIter::new(sources)?;

    let filename = sst_filename();
    let path = shared.opts.sst_dir.join(&filename);
    let mut writer = sstable::Writer::create(&path)?;
    let mut last: Option<(Vec<u8>, i64)> = None;
    for row in merged {
        let row = row?;
        // Identical (key, timestamp) pairs across inputs collapse to the
        // copy from the first source.
        if last
            .as_ref()
            .is_some_and(|(k, t)| *k == row.key && *t == row.timestamp)
        {
            continue;
        }
        writer.append(&row.key, row.timestamp, row.value.as_deref())?;
        last = Some((row.key, row.timestamp));
    }
    writer.finish()?;

    let reader = Arc::new(sstable::Reader::open(&path, shared.cache.clone())?);

    let input_names: HashSet<String> = inputs
        .iter()
        .filter_map(|s| s.path().file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();

    {
        let mut descriptor = shared.descriptor.lock().expect("descriptor poisoned");
        let applied_until = descriptor
            .current
            .sst_meta
            .iter()
            .filter(|m| input_names.contains(&m.filename))
            .map(|m| m.applied_until)
            .max()
            .unwrap_or(0);
        let survivors: Vec<SstMeta> = descriptor
            .current
            .sst_meta
            .drain(..)
            .filter(|m| !input_names.contains(&m.filename))
            .collect();
        descriptor.current.sst_meta.push(SstMeta {
            filename,
            applied_until,
        });
        descriptor.current.sst_meta.extend(survivors);
        descriptor.save()?;

        let mut tables = shared.tables.write().expect("engine lock poisoned");
        tables
            .ssts
            .retain(|s| !inputs.iter().any(|i| Arc::ptr_eq(s, i)));
        tables.ssts.insert(0, reader);
    }

    for sst in &inputs {
        sst.mark_obsolete();
    }
    tracing::info!("compaction completed");
    Ok(())
}
