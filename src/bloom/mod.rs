use xxhash_rust::xxh3::xxh3_128;

use crate::error::{Error, Result};

/// Probabilistic data structure: "is this key in the set?"
///
/// - If any bit is 0 → key is DEFINITELY NOT in the set
/// - If all bits are 1 → key is PROBABLY in the set (false positive possible)
///
/// Used in sorted-file reads to skip blocks that definitely don't contain
/// the target key. On a miss-heavy workload this avoids most block fetches,
/// which matters even more when the block lives on a remote memory node.
///
/// Hash trick: we don't need k independent hash functions.
/// Double hashing: h_i(key) = h1(key) + i * h2(key) (mod m)
/// where h1, h2 come from splitting a 128-bit xxh3 into two 64-bit halves.
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u32,
}

impl BloomFilter {
    /// Create a bloom filter sized at `bits_per_key` bits for `expected_items`
    /// keys. 10 bits/key gives roughly a 1% false positive rate.
    pub fn with_bits_per_key(expected_items: usize, bits_per_key: usize) -> Self {
        let expected_items = expected_items.max(1);
        let num_bits = (expected_items * bits_per_key).max(64) as u32;

        // k = bits_per_key * ln(2), clamped to something sane.
        let num_hashes = ((bits_per_key as f64) * 2.0f64.ln()).ceil() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        let num_u64s = (num_bits as usize).div_ceil(64);
        BloomFilter {
            bits: vec![0u64; num_u64s],
            num_hashes,
            num_bits,
        }
    }

    /// Add a key to the bloom filter.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_key(key);
        for i in 0..self.num_hashes {
            let pos = self.bit_position(h1, h2, i);
            self.set_bit(pos);
        }
    }

    /// Check if a key MIGHT be in the set.
    /// false → definitely not here. true → probably here.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_key(key);
        for i in 0..self.num_hashes {
            let pos = self.bit_position(h1, h2, i);
            if !self.check_bit(pos) {
                return false;
            }
        }
        true
    }

    /// Serialize to bytes for embedding in a sorted file's filter block.
    /// Format: [num_hashes(4B)][num_bits(4B)][bit words (8B each)]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.bits.len() * 8);
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        for word in &self.bits {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    /// Deserialize a filter previously produced by [`serialize`](Self::serialize).
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Corruption("bloom filter too short".into()));
        }
        let num_hashes = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let num_bits = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let words = &data[8..];
        if words.len() % 8 != 0 || words.len() / 8 < (num_bits as usize).div_ceil(64) {
            return Err(Error::Corruption("bloom filter bit array truncated".into()));
        }
        if num_hashes == 0 || num_bits == 0 {
            return Err(Error::Corruption("bloom filter with empty shape".into()));
        }
        let bits = words
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(BloomFilter {
            bits,
            num_hashes,
            num_bits,
        })
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    fn bit_position(&self, h1: u64, h2: u64, i: u32) -> u32 {
        let i = i as u64;
        (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits as u64) as u32
    }

    fn set_bit(&mut self, pos: u32) {
        self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
    }

    fn check_bit(&self, pos: u32) -> bool {
        (self.bits[(pos / 64) as usize] >> (pos % 64)) & 1 == 1
    }
}

fn hash_key(key: &[u8]) -> (u64, u64) {
    let hash128 = xxh3_128(key);
    ((hash128 & u64::MAX as u128) as u64, (hash128 >> 64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_probe() {
        let mut bf = BloomFilter::with_bits_per_key(100, 10);
        bf.insert(b"hello");
        assert!(bf.may_contain(b"hello"));
        assert!(!bf.may_contain(b"world"));
    }

    #[test]
    fn no_false_negatives() {
        let mut bf = BloomFilter::with_bits_per_key(1000, 10);
        for i in 0..1000u32 {
            bf.insert(format!("key_{i}").as_bytes());
        }
        for i in 0..1000u32 {
            assert!(bf.may_contain(format!("key_{i}").as_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_reasonable() {
        let mut bf = BloomFilter::with_bits_per_key(1000, 10);
        for i in 0..1000u32 {
            bf.insert(format!("key_{i}").as_bytes());
        }
        let mut false_positives = 0;
        for i in 0..10_000u32 {
            if bf.may_contain(format!("absent_{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // 10 bits/key targets ~1%; allow generous slack.
        assert!(false_positives < 500, "fp rate too high: {false_positives}");
    }

    #[test]
    fn serialize_roundtrip() {
        let mut bf = BloomFilter::with_bits_per_key(50, 10);
        for i in 0..50u32 {
            bf.insert(format!("k{i}").as_bytes());
        }
        let bytes = bf.serialize();
        let restored = BloomFilter::deserialize(&bytes).unwrap();
        assert_eq!(restored.num_hashes(), bf.num_hashes());
        assert_eq!(restored.num_bits(), bf.num_bits());
        for i in 0..50u32 {
            assert!(restored.may_contain(format!("k{i}").as_bytes()));
        }
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(BloomFilter::deserialize(&[1, 2, 3]).is_err());
        assert!(BloomFilter::deserialize(&[0u8; 8]).is_err());
    }
}
