//! Heap-merge of sorted row streams.
//!
//! Merges any number of iterators that each yield rows in (key ascending,
//! timestamp descending) order into a single stream with the same order.
//! Ties on (key, timestamp) are broken by source index, so when the
//! compactor lists newer SSTs first their row wins the tie. No version is
//! suppressed: every distinct (key, timestamp) pair of the inputs appears
//! in the output, which keeps the full history available for readers that
//! pick the newest timestamp.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{Error, Result};

/// A single versioned row. `value` of `None` is a deletion tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub timestamp: i64,
    pub value: Option<Vec<u8>>,
}

/// Boxed source stream for the merge.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row>> + Send + 'a>;

struct HeapEntry {
    row: Row,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse the row order so the smallest
        // (key asc, ts desc, source asc) entry surfaces first.
        self.row
            .key
            .cmp(&other.row.key)
            .then_with(|| other.row.timestamp.cmp(&self.row.timestamp))
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// An iterator merging multiple ordered row streams.
pub struct MergingIter<'a> {
    sources: Vec<RowIter<'a>>,
    heap: BinaryHeap<HeapEntry>,
    pending_error: Option<Error>,
}

impl<'a> MergingIter<'a> {
    pub fn new(mut sources: Vec<RowIter<'a>>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(row) = iter.next().transpose()? {
                heap.push(HeapEntry { row, source });
            }
        }
        Ok(Self {
            sources,
            heap,
            pending_error: None,
        })
    }
}

impl Iterator for MergingIter<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        let entry = self.heap.pop()?;
        // Pop the minimum, expose it, advance its source, re-push if still
        // live. A failed advance must not eat the row already in hand, so
        // the error is held back until the following call.
        match self.sources[entry.source].next() {
            Some(Ok(row)) => self.heap.push(HeapEntry {
                row,
                source: entry.source,
            }),
            Some(Err(e)) => self.pending_error = Some(e),
            None => {}
        }
        Some(Ok(entry.row))
    }
}
