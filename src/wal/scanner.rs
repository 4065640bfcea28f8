//! WAL recovery scan.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::errcorrupt;
use crate::error::Result;

use super::{list_segments, Record, CASTAGNOLI, FRAME_HEADER_SIZE, MAX_RECORD_BYTES};

/// Reads log records across all segments of a WAL directory as one logical
/// stream, in sequence order. Not thread-safe.
pub struct Scanner {
    segments: Vec<(i64, PathBuf)>,
    index: usize,
    current: Option<FileScanner>,
}

impl Scanner {
    /// Opens a scanner over every segment found in `dir`. A missing or
    /// empty directory scans as an empty log.
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            segments: list_segments(dir)?,
            index: 0,
            current: None,
        })
    }

    fn read_record(&mut self) -> Result<Option<Record>> {
        loop {
            if self.current.is_none() {
                let Some((_, path)) = self.segments.get(self.index) else {
                    return Ok(None);
                };
                self.index += 1;
                self.current = Some(FileScanner::open(path)?);
            }
            match self.current.as_mut().unwrap().read_record()? {
                Some(record) => return Ok(Some(record)),
                None => self.current = None,
            }
        }
    }
}

impl Iterator for Scanner {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

struct FileScanner {
    r: BufReader<File>,
}

impl FileScanner {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            r: BufReader::new(File::open(path)?),
        })
    }

    fn read_record(&mut self) -> Result<Option<Record>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.r.read(&mut header[filled..])?;
            if n == 0 {
                // Nothing read at a frame boundary is a clean end of
                // segment; a torn header is not.
                if filled == 0 {
                    return Ok(None);
                }
                return Err(errcorrupt!("torn frame header at segment end"));
            }
            filled += n;
        }

        let len = LittleEndian::read_u32(&header[0..4]);
        let crc = LittleEndian::read_u32(&header[4..8]);
        if len > MAX_RECORD_BYTES {
            return Err(errcorrupt!("framed record of {len} bytes exceeds limit"));
        }

        let mut payload = vec![0u8; len as usize];
        self.r
            .read_exact(&mut payload)
            .map_err(|_| errcorrupt!("torn record payload"))?;

        let computed = CASTAGNOLI.checksum(&payload);
        if computed != crc {
            return Err(errcorrupt!(
                "record checksum mismatch: expected {crc}, got {computed}"
            ));
        }

        Ok(Some(bincode::deserialize(&payload)?))
    }
}
