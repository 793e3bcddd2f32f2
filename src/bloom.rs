//! Bloom filter over commit ids, embedded in every commit as
//! `ancestorsFilter` (§3) and exchanged wholesale during sync (§4.6).
//!
//! Sized once per deployment (capacity, target false-positive rate) so
//! sibling filters share bit-array layout and can be unioned bitwise when
//! a new commit's filter is built from its parents' filters (§9's
//! "canonical encoding" note doesn't cover this, but a fixed sketch shape
//! is what makes that union well-defined).

use serde::{Deserialize, Serialize};

/// Default shape used for every `ancestorsFilter` in a process. A single
/// fixed (capacity, fpr) keeps all filters the same bit-array length, so
/// `union_with` is a plain bitwise OR rather than a lossy re-hash.
pub const DEFAULT_CAPACITY: usize = 4096;
pub const DEFAULT_FPR: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Derives bit-array size `m` and hash count `k` from the standard
    /// formulas: `m = ceil(-n*ln(p) / ln(2)^2)`, `k = round(m/n * ln(2))`.
    pub fn new(capacity: usize, target_fpr: f64) -> Self {
        let n = capacity.max(1) as f64;
        let p = target_fpr.clamp(f64::MIN_POSITIVE, 0.5);
        let m = (-(n * p.ln()) / (std::f64::consts::LN_2.powi(2))).ceil().max(8.0) as usize;
        let k = ((m as f64 / n) * std::f64::consts::LN_2).round().max(1.0) as u32;
        let words = (m + 63) / 64;
        BloomFilter {
            bits: vec![0u64; words],
            num_bits: words * 64,
            num_hashes: k,
        }
    }

    /// The well-defined empty value: no elements added, default shape.
    pub fn empty() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_FPR)
    }

    fn positions(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let hash = blake3::hash(key);
        let bytes = hash.as_bytes();
        let h1 = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let h2 = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let num_bits = self.num_bits as u64;
        (0..self.num_hashes).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (combined % num_bits) as usize
        })
    }

    pub fn add(&mut self, key: &[u8]) {
        for pos in self.positions(key).collect::<Vec<_>>() {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.positions(key).collect::<Vec<_>>().into_iter().all(|pos| {
            self.bits[pos / 64] & (1 << (pos % 64)) != 0
        })
    }

    /// Bitwise-ORs `other`'s bits into `self`. Requires identical shape
    /// (guaranteed when every filter in a deployment is built via the
    /// same `(capacity, fpr)` pair); mismatched shapes are silently
    /// skipped rather than panicking, since a union with a foreign-shaped
    /// filter would otherwise corrupt this filter's own bits.
    pub fn union_with(&mut self, other: &BloomFilter) {
        if self.num_bits != other.num_bits || self.bits.len() != other.bits.len() {
            return;
        }
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("bloom filter always serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_keys_always_reported_present() {
        let mut f = BloomFilter::new(100, 0.01);
        for i in 0..100 {
            f.add(format!("key-{i}").as_bytes());
        }
        for i in 0..100 {
            assert!(f.may_contain(format!("key-{i}").as_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let capacity = 1000;
        let target_fpr = 0.01;
        let mut f = BloomFilter::new(capacity, target_fpr);
        for i in 0..capacity {
            f.add(format!("present-{i}").as_bytes());
        }
        let mut false_positives = 0;
        for i in 0..capacity {
            if f.may_contain(format!("absent-{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        let observed = false_positives as f64 / capacity as f64;
        assert!(observed <= target_fpr * 2.0, "observed fpr {observed} exceeded 2x target");
    }

    #[test]
    fn union_merges_membership() {
        let mut a = BloomFilter::new(100, 0.01);
        let mut b = BloomFilter::new(100, 0.01);
        a.add(b"from-a");
        b.add(b"from-b");
        a.union_with(&b);
        assert!(a.may_contain(b"from-a"));
        assert!(a.may_contain(b"from-b"));
    }

    #[test]
    fn empty_filter_contains_nothing_added() {
        let f = BloomFilter::empty();
        assert!(!f.may_contain(b"anything"));
    }
}
