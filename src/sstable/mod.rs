//! Sorted string table files.
//!
//! An SST is an immutable, sorted, random-read file:
//!
//! ```text
//! data block 0 ‖ crc
//! ...
//! data block N-1 ‖ crc
//! filter block ‖ crc
//! index block  ‖ crc
//! footer
//! ```
//!
//! Data and index blocks share the restart-interval prefix compression in
//! [`block`]; the filter block is a Bloom filter over the user keys; the
//! fixed-size footer carries the index and filter block handles, a
//! checksum over them, and the magic. All checksums are CRC-32C.

pub mod block;
pub mod bloom;
pub mod table;

pub use table::{Reader, Writer};

use crc::{Crc, CRC_32_ISCSI};

use crate::errcorrupt;
use crate::error::Result;

pub(crate) const SST_MAGIC: u64 = 0xe489f8a9d479536b;

pub(crate) const MAX_VARINT_LEN64: usize = 10;
/// Each footer handle slot fits a worst-case (offset, size) varint pair.
pub(crate) const HANDLE_REGION: usize = 2 * MAX_VARINT_LEN64;
/// index handle region ‖ filter handle region ‖ crc32c ‖ magic.
pub(crate) const FOOTER_SIZE: usize = 2 * HANDLE_REGION + 4 + 8;

/// Uncompressed data block target size.
pub(crate) const BLOCK_SIZE: usize = 16 * 1024;

/// Value cell type tags. A delete cell has no bytes after the tag.
pub(crate) const TAG_DELETE: u8 = 1;
pub(crate) const TAG_PUT: u8 = 2;

pub(crate) const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The location of a block within an SST file. `size` excludes the
/// trailing checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, self.offset);
        put_uvarint(buf, self.size);
    }

    /// Decodes a handle from the front of `data`, ignoring any padding
    /// after the two varints.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let offset = read_uvarint(data, &mut pos)?;
        let size = read_uvarint(data, &mut pos)?;
        Ok(Self { offset, size })
    }
}

pub(crate) fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push(v as u8 | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(crate) fn read_uvarint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let Some(&b) = data.get(*pos) else {
            return Err(errcorrupt!("truncated varint"));
        };
        *pos += 1;
        // The tenth byte carries at most the top bit of a u64.
        if shift >= 63 && b > 1 {
            return Err(errcorrupt!("varint overflows u64"));
        }
        v |= ((b & 0x7f) as u64) << shift;
        if b < 0x80 {
            return Ok(v);
        }
        shift += 7;
    }
}

/// Decodes a value cell (tag + payload) into `Some(bytes)` or the
/// tombstone `None`.
pub(crate) fn decode_cell(cell: &[u8]) -> Result<Option<Vec<u8>>> {
    match cell.split_first() {
        Some((&TAG_PUT, payload)) => Ok(Some(payload.to_vec())),
        Some((&TAG_DELETE, [])) => Ok(None),
        Some((&TAG_DELETE, _)) => Err(errcorrupt!("delete cell carries a payload")),
        Some((&tag, _)) => Err(errcorrupt!("unknown value cell tag {tag}")),
        None => Err(errcorrupt!("empty value cell")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(read_uvarint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_uvarint_truncated() {
        let mut pos = 0;
        assert!(read_uvarint(&[0x80], &mut pos).is_err());
        let mut pos = 0;
        assert!(read_uvarint(&[], &mut pos).is_err());
    }

    #[test]
    fn test_handle_roundtrip_with_padding() {
        let handle = BlockHandle {
            offset: 123456,
            size: 789,
        };
        let mut buf = Vec::new();
        handle.encode_to(&mut buf);
        assert!(buf.len() <= HANDLE_REGION);
        buf.resize(HANDLE_REGION, 0);
        assert_eq!(BlockHandle::decode(&buf).unwrap(), handle);
    }

    #[test]
    fn test_decode_cell() {
        assert_eq!(decode_cell(&[TAG_PUT, b'h', b'i']).unwrap(), Some(b"hi".to_vec()));
        assert_eq!(decode_cell(&[TAG_PUT]).unwrap(), Some(Vec::new()));
        assert_eq!(decode_cell(&[TAG_DELETE]).unwrap(), None);
        assert!(decode_cell(&[TAG_DELETE, 0x01]).is_err());
        assert!(decode_cell(&[9, 1, 2]).is_err());
        assert!(decode_cell(&[]).is_err());
    }
}
