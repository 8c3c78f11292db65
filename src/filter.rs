//! Pluggable filter policies.
//!
//! A filter is a pure optimization hint for point lookups: "definitely
//! absent" answers let the reader skip a block fetch entirely. Filters are
//! advisory — a policy that always answers "maybe" (or even always "no")
//! must never change lookup results, only lookup cost. The read path treats
//! a negative answer as permission to skip, and nothing else.

use crate::bloom::BloomFilter;

/// Capability contract for filter plugins.
pub trait FilterPolicy: Send + Sync {
    /// Identifies the policy. Stored alongside the filter block so a reader
    /// can ignore filters built by a different policy.
    fn name(&self) -> &'static str;

    /// Build a serialized filter covering `keys` (user keys).
    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8>;

    /// Probe a filter previously produced by `create_filter`.
    /// False positives are allowed; false negatives are not.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// The standard bloom filter policy.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        BloomFilterPolicy {
            bits_per_key: bits_per_key.max(1),
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "lsm-remote.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8> {
        let mut bloom = BloomFilter::with_bits_per_key(keys.len(), self.bits_per_key);
        for key in keys {
            bloom.insert(key);
        }
        bloom.serialize()
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        match BloomFilter::deserialize(filter) {
            Ok(bloom) => bloom.may_contain(key),
            // An unreadable filter degrades to "no filter", never to a miss.
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_policy_roundtrip() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<&[u8]> = vec![b"alpha", b"beta", b"gamma"];
        let filter = policy.create_filter(&keys);
        assert!(policy.key_may_match(b"alpha", &filter));
        assert!(policy.key_may_match(b"gamma", &filter));
        assert!(!policy.key_may_match(b"delta", &filter));
    }

    #[test]
    fn corrupt_filter_degrades_to_maybe() {
        let policy = BloomFilterPolicy::new(10);
        assert!(policy.key_may_match(b"anything", &[0xde, 0xad]));
    }
}
