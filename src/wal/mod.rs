//! Write-ahead log.
//!
//! A directory of append-only segment files named `wal-<seq>.log`, where
//! `<seq>` is the sequence number of the first record the segment holds.
//! Each record is framed as `len:u32le ‖ crc32c:u32le ‖ payload`, with the
//! payload a bincode-serialized [`Record`].

pub mod cleaner;
pub mod scanner;
pub mod writer;

pub use cleaner::remove_applied_segments;
pub use scanner::Scanner;
pub use writer::Writer;

use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::errinput;
use crate::error::{Error, Result};

/// The largest size a single record can be.
pub const MAX_RECORD_BYTES: u32 = 100 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 8;

pub(crate) const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A durable log record: the engine-assigned sequence number and the
/// mutation it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub sequence: i64,
    pub mutation: Mutation,
}

/// A single key mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: Vec<u8>,
    pub timestamp: i64,
    pub op: Op,
}

/// The mutation operation. `Delete` carries no payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Put(Vec<u8>),
    Delete,
}

/// Serializes and frames a record for appending to a segment.
pub(crate) fn encode_frame(record: &Record) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record).map_err(|e| Error::Io(e.to_string()))?;
    if payload.len() > MAX_RECORD_BYTES as usize {
        return Err(errinput!(
            "log record of {} bytes exceeds {MAX_RECORD_BYTES}",
            payload.len()
        ));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&[0; FRAME_HEADER_SIZE]);
    LittleEndian::write_u32(&mut frame[0..4], payload.len() as u32);
    LittleEndian::write_u32(&mut frame[4..8], CASTAGNOLI.checksum(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub(crate) fn segment_name(sequence: i64) -> String {
    format!("wal-{sequence}.log")
}

fn parse_segment_name(name: &str) -> Option<i64> {
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// Lists the WAL segments in `dir`, sorted by starting sequence number.
/// A missing directory reads as an empty log.
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(i64, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        match parse_segment_name(name) {
            Some(seq) => segments.push((seq, entry.path())),
            None => {
                tracing::warn!(file = name, "skipping non-WAL file in log directory");
            }
        }
    }
    segments.sort_by_key(|&(seq, _)| seq);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_name(1), "wal-1.log");
        assert_eq!(segment_name(1234567), "wal-1234567.log");
        assert_eq!(parse_segment_name("wal-42.log"), Some(42));
        assert_eq!(parse_segment_name("wal-.log"), None);
        assert_eq!(parse_segment_name("descriptor.3"), None);
        assert_eq!(parse_segment_name("wal-9.log.tmp"), None);
    }

    #[test]
    fn test_list_segments_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for seq in [30, 1, 200] {
            std::fs::write(dir.path().join(segment_name(seq)), b"").unwrap();
        }
        std::fs::write(dir.path().join("stray.txt"), b"").unwrap();

        let segments = list_segments(dir.path()).unwrap();
        let seqs: Vec<i64> = segments.iter().map(|&(s, _)| s).collect();
        assert_eq!(seqs, vec![1, 30, 200]);
    }

    #[test]
    fn test_list_segments_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(list_segments(&missing).unwrap().is_empty());
    }

    #[test]
    fn test_frame_roundtrip_fields() {
        let record = Record {
            sequence: 9,
            mutation: Mutation {
                key: b"k".to_vec(),
                timestamp: 77,
                op: Op::Put(b"v".to_vec()),
            },
        };
        let frame = encode_frame(&record).unwrap();
        let len = LittleEndian::read_u32(&frame[0..4]) as usize;
        let crc = LittleEndian::read_u32(&frame[4..8]);
        assert_eq!(len, frame.len() - FRAME_HEADER_SIZE);
        assert_eq!(crc, CASTAGNOLI.checksum(&frame[8..]));
        let decoded: Record = bincode::deserialize(&frame[8..]).unwrap();
        assert_eq!(decoded, record);
    }
}
