//! Prefix-compressed blocks.
//!
//! A block packs a sorted run of (key, value) entries. Every 16th entry is
//! a *restart* stored with its full key; the entries between store only
//! the suffix that differs from their predecessor, as
//! `shared:uvarint ‖ non_shared:uvarint ‖ suffix ‖ value_len:uvarint ‖
//! value`. The block tail is the restart offset array (u32le each)
//! followed by the restart count (u32le), giving binary search its
//! anchors.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;

use super::read_uvarint;

const RESTART_INTERVAL: usize = 16;

/// Builds a prefix-compressed block in memory.
pub(crate) struct Builder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    last_key: Vec<u8>,
    count: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            restarts: vec![0],
            last_key: Vec::new(),
            count: 0,
        }
    }

    /// Appends an entry. Keys must arrive in ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let mut shared = 0;
        if self.count < RESTART_INTERVAL {
            let max = self.last_key.len().min(key.len());
            while shared < max && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.count = 0;
            self.restarts.push(self.buf.len() as u32);
        }
        self.count += 1;

        super::put_uvarint(&mut self.buf, shared as u64);
        super::put_uvarint(&mut self.buf, (key.len() - shared) as u64);
        self.buf.extend_from_slice(&key[shared..]);
        super::put_uvarint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current size once the restart array is accounted for.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    /// Appends the restart array and returns the finished block bytes.
    pub fn finish(mut self) -> Vec<u8> {
        for &r in &self.restarts {
            self.buf.write_u32::<LittleEndian>(r).expect("vec write");
        }
        self.buf
            .write_u32::<LittleEndian>(self.restarts.len() as u32)
            .expect("vec write");
        self.buf
    }
}

/// A parsed block, ready for seeks and scans.
pub(crate) struct Block {
    data: Arc<Vec<u8>>,
    entries_end: usize,
    restarts: Vec<u32>,
}

impl Block {
    pub fn parse(data: Arc<Vec<u8>>) -> Result<Self> {
        let len = data.len();
        if len < 4 {
            return Err(errcorrupt!("block shorter than its restart count"));
        }
        let n_restarts = LittleEndian::read_u32(&data[len - 4..]) as usize;
        let Some(entries_end) = (len - 4).checked_sub(n_restarts * 4) else {
            return Err(errcorrupt!("block shorter than its restart array"));
        };
        let mut restarts = Vec::with_capacity(n_restarts);
        for i in 0..n_restarts {
            let at = entries_end + i * 4;
            let offset = LittleEndian::read_u32(&data[at..at + 4]);
            if offset as usize > entries_end {
                return Err(errcorrupt!("restart offset outside entry region"));
            }
            restarts.push(offset);
        }
        Ok(Self {
            data,
            entries_end,
            restarts,
        })
    }

    /// Reads the entry at `*pos`, reconstructing its key against
    /// `last_key`. Both cursors advance past the entry. Returns `None` at
    /// the end of the entry region.
    pub fn read_entry<'a>(
        &'a self,
        pos: &mut usize,
        last_key: &mut Vec<u8>,
    ) -> Result<Option<(Vec<u8>, &'a [u8])>> {
        let data = &self.data[..self.entries_end];
        if *pos >= data.len() {
            return Ok(None);
        }
        let shared = read_uvarint(data, pos)? as usize;
        let non_shared = read_uvarint(data, pos)? as usize;
        if shared > last_key.len() {
            return Err(errcorrupt!(
                "entry shares {shared} bytes but previous key has {}",
                last_key.len()
            ));
        }
        if *pos + non_shared > data.len() {
            return Err(errcorrupt!("entry key overruns block"));
        }
        let mut key = Vec::with_capacity(shared + non_shared);
        key.extend_from_slice(&last_key[..shared]);
        key.extend_from_slice(&data[*pos..*pos + non_shared]);
        *pos += non_shared;

        let value_len = read_uvarint(data, pos)? as usize;
        if *pos + value_len > data.len() {
            return Err(errcorrupt!("entry value overruns block"));
        }
        let value = &data[*pos..*pos + value_len];
        *pos += value_len;

        last_key.clear();
        last_key.extend_from_slice(&key);
        Ok(Some((key, value)))
    }

    /// Returns the first entry whose key is >= `target`: binary search to
    /// the last restart below the target, then a linear scan within its
    /// run.
    pub fn seek_ge(&self, target: &[u8]) -> Result<Option<(Vec<u8>, &[u8])>> {
        if self.restarts.is_empty() {
            return Ok(None);
        }
        let (mut i, mut j) = (0usize, self.restarts.len() - 1);
        while i < j {
            // Lean right so two remaining candidates test the second.
            let h = (i + j + 1) / 2;
            if self.restart_key(h)?.as_slice() < target {
                i = h;
            } else {
                j = h - 1;
            }
        }

        let mut pos = self.restarts[i] as usize;
        let mut last_key = Vec::new();
        while let Some((key, value)) = self.read_entry(&mut pos, &mut last_key)? {
            if key.as_slice() >= target {
                return Ok(Some((key, value)));
            }
        }
        Ok(None)
    }

    fn restart_key(&self, restart: usize) -> Result<Vec<u8>> {
        let mut pos = self.restarts[restart] as usize;
        let mut last_key = Vec::new();
        match self.read_entry(&mut pos, &mut last_key)? {
            Some((key, _)) => Ok(key),
            None => Err(errcorrupt!("restart points past the entry region")),
        }
    }
}
