//! Bloom pre-filter for the LRU cache.
//!
//! Sized for a fixed 1% false-positive rate at the expected element count.
//! False positives only cost a map lookup; false negatives cannot occur
//! for keys that were inserted since the last `clear`.

use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

const FALSE_POSITIVE_RATE: f64 = 0.01;

/// Fixed-size Bloom filter with double hashing.
pub struct BloomFilter {
    bits: Vec<u64>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// Build a filter sized for `expected_items` at a 1% FP rate.
    pub fn new(expected_items: usize) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let bit_count = ((-n * FALSE_POSITIVE_RATE.ln()) / (ln2 * ln2)).ceil() as u64;
        let bit_count = bit_count.max(64);
        let hash_count = ((bit_count as f64 / n) * ln2).round().max(1.0) as u32;
        let words = bit_count.div_ceil(64) as usize;
        Self {
            bits: vec![0u64; words],
            bit_count,
            hash_count,
        }
    }

    fn hash_pair<K: Hash>(&self, key: &K) -> (u64, u64) {
        let mut h1 = SipHasher13::new_with_keys(0x5153_4f4d_4252_4131, 0x6269_745f_6f6e_655f);
        key.hash(&mut h1);
        let mut h2 = SipHasher13::new_with_keys(0x6269_745f_7477_6f5f, 0x5153_4f4d_4252_4132);
        key.hash(&mut h2);
        (h1.finish(), h2.finish())
    }

    /// Record `key` in the filter.
    pub fn insert<K: Hash>(&mut self, key: &K) {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.hash_count {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bit_count;
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    /// True when `key` may have been inserted; false means definitely not.
    pub fn may_contain<K: Hash>(&self, key: &K) -> bool {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.hash_count {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bit_count;
            if self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.bits.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::new(1000);
        for i in 0..1000u64 {
            filter.insert(&i);
        }
        for i in 0..1000u64 {
            assert!(filter.may_contain(&i), "inserted key {i} reported absent");
        }
    }

    #[test]
    fn false_positive_rate_is_near_one_percent() {
        let mut filter = BloomFilter::new(10_000);
        for i in 0..10_000u64 {
            filter.insert(&i);
        }
        let false_positives = (10_000u64..30_000)
            .filter(|i| filter.may_contain(i))
            .count();
        // 1% nominal rate over 20k absent keys; allow generous slack.
        assert!(
            false_positives < 600,
            "unexpected FP count: {false_positives}"
        );
    }

    #[test]
    fn reset_forgets_inserted_keys() {
        let mut filter = BloomFilter::new(100);
        filter.insert(&42u64);
        assert!(filter.may_contain(&42u64));
        filter.reset();
        assert!(!filter.may_contain(&42u64));
    }

    #[test]
    fn tiny_expected_count_still_works() {
        let mut filter = BloomFilter::new(0);
        filter.insert(&"k");
        assert!(filter.may_contain(&"k"));
    }
}
