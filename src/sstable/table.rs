//! SST writer and reader.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::Cache;
use crate::encoding::{self, orderedcode};
use crate::error::Result;
use crate::merge::Row;
use crate::{errcorrupt, errinput};

use super::block::{Block, Builder};
use super::bloom::Bloom;
use super::{
    decode_cell, BlockHandle, BLOCK_SIZE, CASTAGNOLI, FOOTER_SIZE, HANDLE_REGION, SST_MAGIC,
    TAG_DELETE, TAG_PUT,
};

/// The shared block cache type: keyed by (reader cache id, block offset).
pub type BlockCache = Cache<(u64, u64)>;

/// Builds an SST from rows appended in strict (key asc, timestamp desc)
/// order.
pub struct Writer {
    w: BufWriter<File>,
    offset: u64,
    data_block: Builder,
    index_block: Builder,
    bloom: Bloom,
    last_ekey: Vec<u8>,
    rows: u64,
}

impl Writer {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            w: BufWriter::new(file),
            offset: 0,
            data_block: Builder::new(),
            index_block: Builder::new(),
            bloom: Bloom::new(),
            last_ekey: Vec::new(),
            rows: 0,
        })
    }

    /// Appends a row. `value` of `None` writes a deletion tombstone.
    pub fn append(&mut self, key: &[u8], timestamp: i64, value: Option<&[u8]>) -> Result<()> {
        let ekey = encoding::encode_key(key, timestamp);
        if self.rows > 0 && ekey <= self.last_ekey {
            return Err(errinput!("rows must be appended in (key, timestamp desc) order"));
        }
        if self.data_block.estimated_size() > BLOCK_SIZE {
            self.flush_data_block()?;
        }

        self.bloom.add(key);
        let mut cell = Vec::with_capacity(1 + value.map_or(0, <[u8]>::len));
        match value {
            Some(v) => {
                cell.push(TAG_PUT);
                cell.extend_from_slice(v);
            }
            None => cell.push(TAG_DELETE),
        }
        self.data_block.add(&ekey, &cell);
        self.last_ekey = ekey;
        self.rows += 1;
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.data_block, Builder::new());
        let handle = self.write_checksummed(&block.finish())?;
        let mut encoded = Vec::with_capacity(HANDLE_REGION);
        handle.encode_to(&mut encoded);
        // The index key is the last key of the block it points at.
        self.index_block.add(&self.last_ekey, &encoded);
        Ok(())
    }

    /// Flushes the remaining data block, writes the filter block, index
    /// block and footer, then syncs and closes the file.
    pub fn finish(mut self) -> Result<()> {
        self.flush_data_block()?;

        let filter_handle = {
            let bytes = std::mem::take(&mut self.bloom).into_bytes();
            self.write_checksummed(&bytes)?
        };
        let index_handle = {
            let block = std::mem::replace(&mut self.index_block, Builder::new());
            self.write_checksummed(&block.finish())?
        };

        let mut footer = [0u8; FOOTER_SIZE];
        let mut encoded = Vec::with_capacity(HANDLE_REGION);
        index_handle.encode_to(&mut encoded);
        footer[..encoded.len()].copy_from_slice(&encoded);
        encoded.clear();
        filter_handle.encode_to(&mut encoded);
        footer[HANDLE_REGION..HANDLE_REGION + encoded.len()].copy_from_slice(&encoded);
        let crc = CASTAGNOLI.checksum(&footer[..2 * HANDLE_REGION]);
        LittleEndian::write_u32(&mut footer[2 * HANDLE_REGION..], crc);
        LittleEndian::write_u64(&mut footer[2 * HANDLE_REGION + 4..], SST_MAGIC);
        self.w.write_all(&footer)?;

        self.w.flush()?;
        self.w.get_ref().sync_all()?;
        Ok(())
    }

    fn write_checksummed(&mut self, data: &[u8]) -> Result<BlockHandle> {
        let handle = BlockHandle {
            offset: self.offset,
            size: data.len() as u64,
        };
        self.w.write_all(data)?;
        let mut crc = [0u8; 4];
        LittleEndian::write_u32(&mut crc, CASTAGNOLI.checksum(data));
        self.w.write_all(&crc)?;
        self.offset += data.len() as u64 + 4;
        Ok(handle)
    }
}

/// An SST reader. Thread-safe; shared between queries via `Arc`.
pub struct Reader {
    file: File,
    path: PathBuf,
    index_handle: BlockHandle,
    filter_handle: BlockHandle,
    cache: Option<Arc<BlockCache>>,
    cache_id: u64,
    obsolete: AtomicBool,
}

impl Reader {
    pub fn open(path: &Path, cache: Option<Arc<BlockCache>>) -> Result<Self> {
        let file = File::open(path)?;
        let length = file.metadata()?.len();
        if length < FOOTER_SIZE as u64 {
            return Err(errcorrupt!(
                "sst {} too small to hold a footer",
                path.display()
            ));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, length - FOOTER_SIZE as u64)?;
        if LittleEndian::read_u64(&footer[FOOTER_SIZE - 8..]) != SST_MAGIC {
            return Err(errcorrupt!("sst {} has invalid magic", path.display()));
        }
        let crc = LittleEndian::read_u32(&footer[2 * HANDLE_REGION..2 * HANDLE_REGION + 4]);
        if CASTAGNOLI.checksum(&footer[..2 * HANDLE_REGION]) != crc {
            return Err(errcorrupt!("sst {} footer checksum mismatch", path.display()));
        }

        let cache_id = cache.as_ref().map_or(0, |c| c.next_id());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            index_handle: BlockHandle::decode(&footer[..HANDLE_REGION])?,
            filter_handle: BlockHandle::decode(&footer[HANDLE_REGION..2 * HANDLE_REGION])?,
            cache,
            cache_id,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Looks up the newest version of `key` in this SST. Returns `None` if
    /// the key is absent here, `Some((None, ts))` for a tombstone.
    pub fn find(&self, key: &[u8]) -> Result<Option<(Option<Vec<u8>>, i64)>> {
        let filter = self.read_block(self.filter_handle, true)?;
        if !Bloom::test(&filter, key) {
            return Ok(None);
        }

        let prefix = encoding::encode_key_prefix(key);
        let index = Block::parse(self.read_block(self.index_handle, true)?)?;
        let Some((_, handle)) = index.seek_ge(&prefix)? else {
            return Ok(None);
        };
        let handle = BlockHandle::decode(handle)?;

        let data = Block::parse(self.read_block(handle, true)?)?;
        let Some((ekey, cell)) = data.seek_ge(&prefix)? else {
            return Ok(None);
        };
        if !ekey.starts_with(&prefix) {
            return Ok(None);
        }
        let (timestamp, rest) =
            orderedcode::parse_i64(&ekey[prefix.len()..], orderedcode::Dir::Desc)?;
        if !rest.is_empty() {
            return Err(errcorrupt!("trailing bytes after row timestamp"));
        }
        Ok(Some((decode_cell(cell)?, timestamp)))
    }

    /// Iterates every row in stored order. Bypasses cache fill so bulk
    /// scans do not wash newly cached blocks through the young segment.
    pub fn iter(&self) -> Result<Iter<'_>> {
        let index = Block::parse(self.read_block(self.index_handle, false)?)?;
        let mut handles = Vec::new();
        let mut pos = 0;
        let mut last_key = Vec::new();
        while let Some((_, value)) = index.read_entry(&mut pos, &mut last_key)? {
            handles.push(BlockHandle::decode(value)?);
        }
        Ok(Iter {
            reader: self,
            handles,
            next_handle: 0,
            block: None,
            pos: 0,
            last_key: Vec::new(),
        })
    }

    /// Marks the file for deletion once the last reference drops, after it
    /// has left the descriptor.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_block(&self, handle: BlockHandle, fill_cache: bool) -> Result<Arc<Vec<u8>>> {
        let cache_key = (self.cache_id, handle.offset);
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.get(&cache_key) {
                return Ok(block);
            }
        }

        let mut raw = vec![0u8; handle.size as usize + 4];
        self.file.read_exact_at(&mut raw, handle.offset)?;
        let crc = LittleEndian::read_u32(&raw[handle.size as usize..]);
        raw.truncate(handle.size as usize);
        if CASTAGNOLI.checksum(&raw) != crc {
            return Err(errcorrupt!(
                "block at offset {} of {} failed checksum",
                handle.offset,
                self.path.display()
            ));
        }

        let block = Arc::new(raw);
        if fill_cache {
            if let Some(cache) = &self.cache {
                cache.insert(cache_key, block.clone());
            }
        }
        Ok(block)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            tracing::info!(path = %self.path.display(), "removing obsolete sst");
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "error removing sst");
            }
        }
    }
}

/// Sequential scan over all rows of an SST, lazily loading data blocks.
pub struct Iter<'a> {
    reader: &'a Reader,
    handles: Vec<BlockHandle>,
    next_handle: usize,
    block: Option<Block>,
    pos: usize,
    last_key: Vec<u8>,
}

impl Iter<'_> {
    fn read_row(&mut self) -> Result<Option<Row>> {
        loop {
            if self.block.is_none() {
                let Some(&handle) = self.handles.get(self.next_handle) else {
                    return Ok(None);
                };
                self.next_handle += 1;
                self.block = Some(Block::parse(self.reader.read_block(handle, false)?)?);
                self.pos = 0;
                self.last_key.clear();
            }

            let block = self.block.as_ref().unwrap();
            match block.read_entry(&mut self.pos, &mut self.last_key)? {
                Some((ekey, cell)) => {
                    let (key, timestamp) = encoding::decode_key(&ekey)?;
                    let value = decode_cell(cell)?;
                    return Ok(Some(Row {
                        key,
                        timestamp,
                        value,
                    }));
                }
                None => self.block = None,
            }
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_row().transpose()
    }
}
