//! Persistent descriptor.
//!
//! The descriptor is the authoritative manifest of live SSTs and the
//! sequence watermark each one covers. It is stored as
//! `descriptor.<version>`: a `len:u32le ‖ crc32c:u32le` frame around a
//! bincode body. Every save writes version v+1, syncs it, then deletes
//! version v, so a crash leaves either the old file or the new one and a
//! reader simply takes the highest version. Not thread-safe; the engine
//! serializes access.

use std::fs::File;
use std::io::{BufWriter, Read, Write as _};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::errcorrupt;
use crate::error::Result;

const DESCRIPTOR_PREFIX: &str = "descriptor.";

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A live SST and the largest log sequence number whose mutation is
/// guaranteed to be included in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SstMeta {
    pub filename: String,
    pub applied_until: i64,
}

/// The persisted descriptor body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub sst_meta: Vec<SstMeta>,
}

/// Describes all durable engine state.
pub struct Descriptor {
    /// The current descriptor contents. Mutate, then `save`.
    pub current: State,
    dir: PathBuf,
    version: i64,
}

impl Descriptor {
    /// Returns a descriptor for a brand new database. Nothing is written
    /// until the first `save`.
    pub fn create(dir: &Path) -> Self {
        Self {
            current: State::default(),
            dir: dir.to_path_buf(),
            version: 0,
        }
    }

    /// Loads the highest-numbered descriptor in `dir`, or `None` if the
    /// directory holds no descriptor at all.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let Some((version, path)) = find_latest(dir)? else {
            return Ok(None);
        };
        tracing::info!(path = %path.display(), "opening descriptor");

        let mut file = File::open(&path)?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)
            .map_err(|_| errcorrupt!("descriptor frame header truncated"))?;
        let len = LittleEndian::read_u32(&header[0..4]) as usize;
        let crc = LittleEndian::read_u32(&header[4..8]);

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| errcorrupt!("descriptor body truncated"))?;
        if CASTAGNOLI.checksum(&data) != crc {
            return Err(errcorrupt!("descriptor {} has invalid crc", path.display()));
        }

        Ok(Some(Self {
            current: bincode::deserialize(&data)?,
            dir: dir.to_path_buf(),
            version,
        }))
    }

    /// Persists the current state as version v+1, then best-effort removes
    /// version v. This is the commit point for flush and compaction.
    pub fn save(&mut self) -> Result<()> {
        let data = bincode::serialize(&self.current)?;
        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[0..4], data.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], CASTAGNOLI.checksum(&data));

        let old_path = self.filename_for(self.version);
        let new_path = self.filename_for(self.version + 1);
        let file = File::create(&new_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(&header)?;
        w.write_all(&data)?;
        w.flush()?;
        w.get_ref().sync_all()?;
        drop(w);
        self.version += 1;

        if let Err(e) = std::fs::remove_file(&old_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %old_path.display(), error = %e, "error removing old descriptor");
            }
        }
        Ok(())
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// The largest applied sequence watermark across live SSTs, 0 when
    /// there are none. Everything at or below it is durable in SST form.
    pub fn max_applied(&self) -> i64 {
        self.current
            .sst_meta
            .iter()
            .map(|m| m.applied_until)
            .max()
            .unwrap_or(0)
    }

    fn filename_for(&self, version: i64) -> PathBuf {
        self.dir.join(format!("{DESCRIPTOR_PREFIX}{version}"))
    }
}

fn find_latest(dir: &Path) -> Result<Option<(i64, PathBuf)>> {
    let mut latest: Option<(i64, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(version_str) = name.strip_prefix(DESCRIPTOR_PREFIX) else {
            continue;
        };
        let Ok(version) = version_str.parse::<i64>() else {
            return Err(errcorrupt!("malformed descriptor filename {name}"));
        };
        if latest.as_ref().map_or(true, |&(v, _)| version > v) {
            latest = Some((version, entry.path()));
        }
    }
    Ok(latest)
}
