//! Fixed-size probabilistic membership filter embedded in every SST.
//!
//! Grounded on the double-hashing technique in the teacher's `bloom` module,
//! but with a size and hash count pinned by the on-disk layout (§6.1): the
//! filter always occupies exactly `FILTER_SIZE_BYTES` on disk, so unlike a
//! general-purpose Bloom filter it takes no `expected_elements` parameter.

use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Size of the filter in bits, fixed so header + filter occupy exactly
/// `DATA_PREFIX` bytes regardless of how many keys are stored.
pub const FILTER_SIZE_BITS: usize = 81_920;
/// Size of the filter in bytes (`FILTER_SIZE_BITS / 8`).
pub const FILTER_SIZE_BYTES: usize = FILTER_SIZE_BITS / 8;
/// Number of independent bit positions set per key.
const NUM_HASHES: u64 = 4;

/// A fixed-size bit array supporting one-sided absence queries over `u64` keys.
///
/// False negatives are impossible: querying a key that was inserted always
/// returns `true`. False positives are possible and expected.
#[derive(Debug, Clone)]
pub struct MembershipFilter {
    bits: Vec<u8>,
}

impl MembershipFilter {
    /// Creates an empty filter with every bit clear.
    pub fn new() -> Self {
        MembershipFilter {
            bits: vec![0u8; FILTER_SIZE_BYTES],
        }
    }

    /// Rebuilds a filter from its raw on-disk bytes (must be exactly
    /// `FILTER_SIZE_BYTES` long).
    pub fn from_bytes(bits: Vec<u8>) -> Self {
        debug_assert_eq!(bits.len(), FILTER_SIZE_BYTES);
        MembershipFilter { bits }
    }

    /// Builds a filter populated from exactly the given key set, as required
    /// by the "filter soundness" invariant.
    pub fn from_keys<'a>(keys: impl Iterator<Item = &'a u64>) -> Self {
        let mut filter = Self::new();
        for key in keys {
            filter.insert(*key);
        }
        filter
    }

    /// Sets the `NUM_HASHES` bit positions derived from `key`.
    pub fn insert(&mut self, key: u64) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..NUM_HASHES {
            let index = Self::bit_index(h1, h2, i);
            self.set_bit(index);
        }
    }

    /// Returns `false` if `key` is definitely absent, `true` if it might be
    /// present.
    pub fn may_contain(&self, key: u64) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..NUM_HASHES {
            let index = Self::bit_index(h1, h2, i);
            if !self.get_bit(index) {
                return false;
            }
        }
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn hash_pair(key: u64) -> (u64, u64) {
        let mut h1 = SipHasher13::new_with_keys(0x0123_4567_89AB_CDEF, 0xFEDC_BA98_7654_3210);
        h1.write_u64(key);
        let h1 = h1.finish();

        let mut h2 = SipHasher13::new_with_keys(0xABCD_EF01_2345_6789, 0x0123_4567_89AB_CDEF);
        h2.write_u64(key);
        let h2 = h2.finish();
        // double hashing needs an odd step to visit all positions
        let h2 = if h2 % 2 == 0 { h2 + 1 } else { h2 };

        (h1, h2)
    }

    fn bit_index(h1: u64, h2: u64, i: u64) -> usize {
        (h1.wrapping_add(i.wrapping_mul(h2)) % FILTER_SIZE_BITS as u64) as usize
    }

    fn set_bit(&mut self, index: usize) {
        self.bits[index / 8] |= 1 << (index % 8);
    }

    fn get_bit(&self, index: usize) -> bool {
        (self.bits[index / 8] & (1 << (index % 8))) != 0
    }
}

impl Default for MembershipFilter {
    fn default() -> Self {
        Self::new()
    }
}
