//! Group-commit WAL writer.
//!
//! `append` assigns the record's sequence number and frames it under a
//! small mutex, then hands it to a dedicated writer thread over a bounded
//! channel. The thread drains whatever has queued up, writes it through a
//! buffered stream, issues a single flush + fsync for the burst, and only
//! then fires the callbacks, in sequence order. Concurrent callers thereby
//! share one fsync without giving up per-record durability.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Error, Result};

use super::{encode_frame, segment_name, Mutation, Record};

const QUEUE_DEPTH: usize = 1024;

/// Invoked once the record (and all records before it) is durable, or with
/// the write error. Runs on the writer thread; must not block on the WAL.
pub type Callback = Box<dyn FnOnce(Result<Record>) + Send>;

struct Pending {
    record: Record,
    frame: Vec<u8>,
    done: Callback,
}

enum Message {
    Append(Pending),
    Shutdown,
}

struct AppendState {
    next_sequence: i64,
}

/// Writes log records to the write-ahead log. Thread-safe.
pub struct Writer {
    state: Mutex<AppendState>,
    tx: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    /// Opens a writer whose first record will get `next_sequence`, creating
    /// the segment `wal-<next_sequence>.log`.
    pub fn open(dir: &Path, next_sequence: i64, target_size: u64) -> Result<Self> {
        let segment = Segment::create(dir, next_sequence)?;
        let (tx, rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let dir = dir.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("wal-writer".into())
            .spawn(move || writer_loop(segment, dir, target_size, rx))
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(Self {
            state: Mutex::new(AppendState { next_sequence }),
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Appends a mutation, returning its assigned sequence number. `done`
    /// fires after the record is synced to disk; callbacks fire in sequence
    /// order across all callers.
    pub fn append(&self, mutation: Mutation, done: Callback) -> Result<i64> {
        let mut state = self.state.lock()?;
        let record = Record {
            sequence: state.next_sequence,
            mutation,
        };
        let frame = encode_frame(&record)?;
        let sequence = record.sequence;
        state.next_sequence += 1;
        // Enqueue while still holding the lock so channel order equals
        // sequence order.
        self.tx
            .send(Message::Append(Pending {
                record,
                frame,
                done,
            }))
            .map_err(|_| Error::Io("wal writer has stopped".into()))?;
        Ok(sequence)
    }

    /// The sequence number the next append will receive.
    pub fn next_sequence(&self) -> i64 {
        self.state.lock().map(|s| s.next_sequence).unwrap_or(0)
    }

    /// Drains queued records, syncs and stops the writer thread.
    pub fn close(&self) -> Result<()> {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.lock()?.take() {
            handle
                .join()
                .map_err(|_| Error::Io("wal writer thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn writer_loop(mut segment: Segment, dir: PathBuf, target_size: u64, rx: Receiver<Message>) {
    loop {
        let Ok(first) = rx.recv() else { break };

        let mut batch = Vec::new();
        let mut shutdown = false;
        match first {
            Message::Append(p) => batch.push(p),
            Message::Shutdown => shutdown = true,
        }
        while let Ok(message) = rx.try_recv() {
            match message {
                Message::Append(p) => batch.push(p),
                Message::Shutdown => shutdown = true,
            }
        }

        let mut result = Ok(());
        for pending in &batch {
            if result.is_ok() {
                result = segment.write(&dir, target_size, pending);
            }
        }
        if result.is_ok() && !batch.is_empty() {
            result = segment.sync();
        }
        if let Err(e) = &result {
            tracing::error!(error = %e, "wal write burst failed");
        }
        for pending in batch {
            (pending.done)(result.clone().map(|()| pending.record));
        }

        if shutdown {
            if let Err(e) = segment.sync() {
                tracing::error!(error = %e, "wal sync on shutdown failed");
            }
            break;
        }
    }
}

struct Segment {
    w: BufWriter<File>,
    size: u64,
}

impl Segment {
    fn create(dir: &Path, sequence: i64) -> Result<Self> {
        let path = dir.join(segment_name(sequence));
        tracing::info!(path = %path.display(), "creating wal segment");
        let file = File::create(&path)?;
        Ok(Self {
            w: BufWriter::new(file),
            size: 0,
        })
    }

    fn write(&mut self, dir: &Path, target_size: u64, pending: &Pending) -> Result<()> {
        if self.size > target_size {
            // Roll over to a segment named for this record. On failure the
            // current segment stays usable and the next record retries.
            self.sync()?;
            *self = Segment::create(dir, pending.record.sequence)?;
        }
        self.w.write_all(&pending.frame)?;
        self.size += pending.frame.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.w.flush()?;
        self.w.get_ref().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{list_segments, Op, Scanner};
    use std::sync::mpsc;
    use std::sync::Arc;

    fn mutation(i: u32) -> Mutation {
        Mutation {
            key: format!("key{i:05}").into_bytes(),
            timestamp: i as i64,
            op: Op::Put(format!("value{i}").into_bytes()),
        }
    }

    #[test]
    fn test_append_assigns_sequences_and_scans_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path(), 1, 1 << 20).unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            let seq = writer
                .append(
                    mutation(i),
                    Box::new(move |res| {
                        tx.send(res.unwrap().sequence).unwrap();
                    }),
                )
                .unwrap();
            assert_eq!(seq, i as i64 + 1);
        }
        writer.close().unwrap();
        let acked: Vec<i64> = rx.try_iter().collect();
        assert_eq!(acked, (1..=10).collect::<Vec<_>>());

        let records: Vec<Record> = Scanner::open(dir.path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.sequence, i as i64 + 1);
            assert_eq!(record.mutation, mutation(i as u32));
        }
    }

    #[test]
    fn test_callbacks_fire_in_sequence_order_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(Writer::open(dir.path(), 1, 8 << 20).unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));

        const WRITERS: usize = 8;
        const PER_WRITER: u32 = 1250; // 10,000 records total
        let mut handles = Vec::new();
        for t in 0..WRITERS {
            let writer = Arc::clone(&writer);
            let order = Arc::clone(&order);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let order = Arc::clone(&order);
                    writer
                        .append(
                            mutation(t as u32 * PER_WRITER + i),
                            Box::new(move |res| {
                                order.lock().unwrap().push(res.unwrap().sequence);
                            }),
                        )
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        writer.close().unwrap();

        // Callback invocation order equals sequence order: 1..=10000.
        let order = order.lock().unwrap();
        let want: Vec<i64> = (1..=(WRITERS as i64 * PER_WRITER as i64)).collect();
        assert_eq!(*order, want);
    }

    #[test]
    fn test_rollover_splits_segments() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path(), 1, 256).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            writer
                .append(
                    mutation(i),
                    Box::new(move |res| {
                        tx.send(res.map(|r| r.sequence)).unwrap();
                    }),
                )
                .unwrap();
        }
        drop(tx);
        let acked: Vec<i64> = rx.iter().map(|r| r.unwrap()).collect();
        assert_eq!(acked.len(), 50);
        writer.close().unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert!(segments.len() > 1, "expected rollover, got one segment");
        assert_eq!(segments[0].0, 1);
        // Each segment starts at the sequence number in its name.
        for window in segments.windows(2) {
            assert!(window[0].0 < window[1].0);
        }

        let records: Vec<Record> = Scanner::open(dir.path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let seqs: Vec<i64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path(), 1, 1 << 20).unwrap();
        writer.close().unwrap();
        let res = writer.append(mutation(0), Box::new(|_| {}));
        assert!(res.is_err());
    }
}
