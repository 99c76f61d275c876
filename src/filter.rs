//! Fixed-size membership filter used to short-circuit segment lookups.
//!
//! A segment's filter answers "might this key be here?" before any index
//! probe or record scan. One CRC-64 checksum is computed per key and its
//! four 16-bit lanes are used as bucket indices into a 65,536-bit set.
//! False positives are possible; false negatives are not.

use crc::{Crc, CRC_64_ECMA_182};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Number of one-bit buckets, one per 16-bit lane value.
const BUCKETS: usize = 1 << 16;

const WORD_BITS: usize = 64;

pub struct KeyFilter {
    bits: Box<[u64; BUCKETS / WORD_BITS]>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0; BUCKETS / WORD_BITS]),
        }
    }

    /// The four 16-bit lanes of the key's 64-bit checksum.
    fn lanes(key: &[u8]) -> [u16; 4] {
        let hash = CRC64.checksum(key);
        [
            (hash >> 48) as u16,
            (hash >> 32) as u16,
            (hash >> 16) as u16,
            hash as u16,
        ]
    }

    pub fn add(&mut self, key: &[u8]) {
        for lane in Self::lanes(key) {
            let bucket = lane as usize;
            self.bits[bucket / WORD_BITS] |= 1 << (bucket % WORD_BITS);
        }
    }

    /// True if the key may have been added; false only if it never was.
    pub fn contains(&self, key: &[u8]) -> bool {
        Self::lanes(key).iter().all(|&lane| {
            let bucket = lane as usize;
            self.bits[bucket / WORD_BITS] & (1 << (bucket % WORD_BITS)) != 0
        })
    }

    /// Zeros every bucket.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }
}

impl Default for KeyFilter {
    fn default() -> Self {
        Self::new()
    }
}
