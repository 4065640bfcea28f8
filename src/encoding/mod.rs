//! Key and record encodings.
//!
//! The engine stores every row under a single byte string that orders rows
//! by (key ascending, timestamp descending): the orderedcode encoding of
//! the user key followed by the decreasing encoding of the signed
//! microsecond timestamp. Plain byte comparison of these encoded keys is
//! the only comparison the memtable, SSTs and merge iterator ever perform.

pub mod orderedcode;

use crate::errcorrupt;
use crate::error::Result;
use orderedcode::Dir;

/// Encodes `(key, timestamp)` into the engine's composite row key.
pub fn encode_key(key: &[u8], timestamp: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 12);
    orderedcode::append_bytes(&mut buf, key, Dir::Asc);
    orderedcode::append_i64(&mut buf, timestamp, Dir::Desc);
    buf
}

/// Encodes just the key portion. Every encoded row key of `key` starts with
/// this prefix, and rows of other keys never do, so the prefix doubles as
/// the lower bound of the key's version range.
pub fn encode_key_prefix(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 4);
    orderedcode::append_bytes(&mut buf, key, Dir::Asc);
    buf
}

/// Decodes a composite row key back into `(key, timestamp)`.
pub fn decode_key(ekey: &[u8]) -> Result<(Vec<u8>, i64)> {
    let (key, rest) = orderedcode::parse_bytes(ekey, Dir::Asc)?;
    let (timestamp, rest) = orderedcode::parse_i64(rest, Dir::Desc)?;
    if !rest.is_empty() {
        return Err(errcorrupt!("{} trailing bytes after row key", rest.len()));
    }
    Ok((key, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        for (key, ts) in [
            (b"a".to_vec(), 0i64),
            (b"foo".to_vec(), 1234567),
            (b"k\x00ff\xff".to_vec(), -9),
            (vec![0u8; 64], i64::MAX),
        ] {
            let ekey = encode_key(&key, ts);
            assert!(ekey.starts_with(&encode_key_prefix(&key)));
            let (k, t) = decode_key(&ekey).unwrap();
            assert_eq!(k, key);
            assert_eq!(t, ts);
        }
    }

    #[test]
    fn test_versions_sort_newest_first() {
        let old = encode_key(b"k", 10);
        let new = encode_key(b"k", 20);
        assert!(new < old, "newer timestamps must sort first");
    }

    #[test]
    fn test_keys_sort_ascending_across_versions() {
        // All versions of "a" sort before any version of "ab", including
        // keys that are prefixes of each other or contain escape bytes.
        let a_new = encode_key(b"a", i64::MAX);
        let a_old = encode_key(b"a", i64::MIN);
        let ab = encode_key(b"ab", i64::MAX);
        let a_nul = encode_key(b"a\x00", i64::MAX);
        assert!(a_new < a_old);
        assert!(a_old < a_nul);
        assert!(a_nul < ab);
    }

    #[test]
    fn test_prefix_is_exclusive_to_key() {
        let prefix = encode_key_prefix(b"a");
        assert!(encode_key(b"a", 5).starts_with(&prefix));
        assert!(!encode_key(b"ab", 5).starts_with(&prefix));
        assert!(!encode_key(b"a\x00", 5).starts_with(&prefix));
    }

    #[test]
    fn test_decode_rejects_trailing_garbage() {
        let mut ekey = encode_key(b"k", 7);
        ekey.push(0x42);
        assert!(decode_key(&ekey).is_err());
    }
}
