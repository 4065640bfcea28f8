//! Bloom filter for the SST filter block.
//!
//! 160,000 bits probed at 7 positions per key. The positions derive from a
//! single murmur3-32 hash by the Kirsch-Mitzenmacher construction: a
//! second hash is the first rotated right by 17, and probe i uses
//! `h1 + i*h2`.

const BLOOM_BITS: u32 = 160_000;
const BLOOM_HASHES: u32 = 7;

/// A Bloom filter over user keys.
pub struct Bloom {
    bits: Vec<u8>,
}

impl Bloom {
    pub fn new() -> Self {
        Self {
            bits: vec![0; BLOOM_BITS as usize / 8 + 1],
        }
    }

    /// Adds `key` to the filter.
    pub fn add(&mut self, key: &[u8]) {
        probe(key, |p| {
            self.bits[p / 8] |= 1 << (p % 8);
            true
        });
    }

    /// Returns whether `key` may be in the set backed by `bits`. False
    /// means definitely absent.
    pub fn test(bits: &[u8], key: &[u8]) -> bool {
        probe(key, |p| bits[p / 8] & (1 << (p % 8)) != 0)
    }

    /// The raw filter block bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Consumes the filter, yielding the filter block bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bits
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Self::new()
    }
}

/// Visits the probe positions for `key` while `f` keeps returning true.
/// Returns false on the first rejected probe.
fn probe(key: &[u8], mut f: impl FnMut(usize) -> bool) -> bool {
    let mut h1 = murmur3::murmur3_32(&mut std::io::Cursor::new(key), 0)
        .expect("murmur3 over a slice cannot fail");
    let h2 = h1.rotate_right(17);
    for _ in 0..BLOOM_HASHES {
        if !f((h1 % BLOOM_BITS) as usize) {
            return false;
        }
        h1 = h1.wrapping_add(h2);
    }
    true
}
