use crate::error::{Error, Result};
use crate::types::ValueType;

/// Header: sequence (8B) + record count (4B).
const HEADER_SIZE: usize = 12;

/// An atomic multi-key update.
///
/// Backed by a single byte buffer so it can be handed to the write-ahead
/// log without re-encoding:
/// ```text
/// [sequence(8B)][count(4B)] then per record:
///   Put:    [0x01][key_len(4B)][key][val_len(4B)][value]
///   Delete: [0x02][key_len(4B)][key]
/// ```
/// The sequence is stamped at commit time; records then apply with
/// sequence, sequence+1, ... in insertion order, so a delete appended
/// after a put of the same key wins.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch {
            rep: vec![0u8; HEADER_SIZE],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.rep.push(ValueType::Put as u8);
        self.rep.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.rep.extend_from_slice(key);
        self.rep.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.rep.extend_from_slice(value);
        self.bump_count(1);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.rep.push(ValueType::Delete as u8);
        self.rep.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.rep.extend_from_slice(key);
        self.bump_count(1);
    }

    /// Concatenate another batch's records onto this one.
    pub fn append(&mut self, other: &WriteBatch) {
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
        self.bump_count(other.count());
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.rep[8..12].try_into().unwrap())
    }

    fn bump_count(&mut self, delta: u32) {
        let n = self.count() + delta;
        self.rep[8..12].copy_from_slice(&n.to_le_bytes());
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.rep[0..8].copy_from_slice(&sequence.to_le_bytes());
    }

    pub(crate) fn sequence(&self) -> u64 {
        u64::from_le_bytes(self.rep[0..8].try_into().unwrap())
    }

    /// The raw bytes, as logged to the WAL.
    pub(crate) fn payload(&self) -> &[u8] {
        &self.rep
    }

    /// Rebuild from a WAL payload, validating structure.
    pub(crate) fn from_payload(payload: Vec<u8>) -> Result<Self> {
        if payload.len() < HEADER_SIZE {
            return Err(Error::Corruption("write batch shorter than header".into()));
        }
        let batch = WriteBatch { rep: payload };
        // Walk the records once to reject a malformed batch up front.
        let mut n = 0u32;
        batch.iterate(|_, _, _| n += 1)?;
        if n != batch.count() {
            return Err(Error::Corruption(format!(
                "write batch count mismatch: header {}, records {n}",
                batch.count()
            )));
        }
        Ok(batch)
    }

    /// Visit every record in insertion order.
    pub(crate) fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(ValueType, &[u8], &[u8]),
    {
        let data = &self.rep[HEADER_SIZE..];
        let mut pos = 0usize;
        let take = |pos: &mut usize, len: usize| -> Result<std::ops::Range<usize>> {
            if *pos + len > data.len() {
                return Err(Error::Corruption("write batch record truncated".into()));
            }
            let range = *pos..*pos + len;
            *pos += len;
            Ok(range)
        };
        while pos < data.len() {
            let tag = data[take(&mut pos, 1)?.start];
            let value_type = ValueType::from_u8(tag)?;
            let klen_range = take(&mut pos, 4)?;
            let klen = u32::from_le_bytes(data[klen_range].try_into().unwrap()) as usize;
            let key_range = take(&mut pos, klen)?;
            match value_type {
                ValueType::Put => {
                    let vlen_range = take(&mut pos, 4)?;
                    let vlen = u32::from_le_bytes(data[vlen_range].try_into().unwrap()) as usize;
                    let val_range = take(&mut pos, vlen)?;
                    visit(value_type, &data[key_range], &data[val_range]);
                }
                ValueType::Delete => {
                    visit(value_type, &data[key_range], &[]);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_delete_roundtrip() {
        let mut batch = WriteBatch::new();
        batch.put(b"bar", b"b");
        batch.put(b"box", b"c");
        batch.delete(b"bar");
        assert_eq!(batch.count(), 3);

        let mut seen = Vec::new();
        batch
            .iterate(|vt, k, v| seen.push((vt, k.to_vec(), v.to_vec())))
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (ValueType::Put, b"bar".to_vec(), b"b".to_vec()),
                (ValueType::Put, b"box".to_vec(), b"c".to_vec()),
                (ValueType::Delete, b"bar".to_vec(), Vec::new()),
            ]
        );
    }

    #[test]
    fn append_merges_counts() {
        let mut a = WriteBatch::new();
        a.put(b"bar", b"b");
        a.put(b"box", b"c");
        let mut b = WriteBatch::new();
        b.delete(b"bar");
        a.append(&b);
        assert_eq!(a.count(), 3);
    }

    #[test]
    fn sequence_stamp() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        batch.set_sequence(77);
        assert_eq!(batch.sequence(), 77);
    }

    #[test]
    fn payload_roundtrip_and_validation() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        batch.delete(b"j");
        batch.set_sequence(5);
        let restored = WriteBatch::from_payload(batch.payload().to_vec()).unwrap();
        assert_eq!(restored.count(), 2);
        assert_eq!(restored.sequence(), 5);

        // Truncated record body must be rejected.
        let mut bad = batch.payload().to_vec();
        bad.truncate(bad.len() - 1);
        assert!(WriteBatch::from_payload(bad).is_err());
    }

    #[test]
    fn clear_resets() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.approximate_size(), 12);
    }
}
