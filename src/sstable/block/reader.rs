use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::iterator::StorageIterator;

/// A parsed data block held in memory.
///
/// Parsing walks the entries once and collects every entry offset, so the
/// iterator gets O(log n) seeks and free backward steps; the restart array
/// in the serialized form bounds how much of that walk a sparser reader
/// would need, but an in-memory block keeps the full offset vector.
pub struct Block {
    /// Raw contents, shared with the block cache.
    data: Arc<Vec<u8>>,
    /// Byte offset of every entry, in order.
    offsets: Vec<u32>,
}

impl Block {
    /// Parse raw (decompressed) block contents.
    pub fn parse(data: Arc<Vec<u8>>) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Corruption("block too short".into()));
        }
        let n = data.len();
        let num_entries = u32::from_le_bytes(data[n - 4..].try_into().unwrap()) as usize;
        let num_restarts = u32::from_le_bytes(data[n - 8..n - 4].try_into().unwrap()) as usize;
        let restart_bytes = num_restarts
            .checked_mul(4)
            .ok_or_else(|| Error::Corruption("restart count overflow".into()))?;
        let data_end = n
            .checked_sub(8 + restart_bytes)
            .ok_or_else(|| Error::Corruption("restart array larger than block".into()))?;

        // An entry is at least 8 header bytes, which bounds how many can
        // fit before the trailer count may drive an allocation.
        if num_entries > data_end / 8 {
            return Err(Error::Corruption(format!(
                "block trailer claims {num_entries} entries in {data_end} data bytes"
            )));
        }

        let mut offsets = Vec::with_capacity(num_entries);
        let mut pos = 0usize;
        while pos < data_end {
            if pos + 8 > data_end {
                return Err(Error::Corruption("truncated block entry header".into()));
            }
            let klen = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let vlen = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
            if pos + 8 + klen + vlen > data_end {
                return Err(Error::Corruption("block entry overruns data area".into()));
            }
            offsets.push(pos as u32);
            pos += 8 + klen + vlen;
        }
        if offsets.len() != num_entries {
            return Err(Error::Corruption(format!(
                "block entry count mismatch: scanned {}, trailer says {num_entries}",
                offsets.len()
            )));
        }
        Ok(Block { data, offsets })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Key and value of entry `i`.
    fn entry(&self, i: usize) -> (&[u8], &[u8]) {
        let pos = self.offsets[i] as usize;
        let klen = u32::from_le_bytes(self.data[pos..pos + 4].try_into().unwrap()) as usize;
        let vlen = u32::from_le_bytes(self.data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let key_start = pos + 8;
        (
            &self.data[key_start..key_start + klen],
            &self.data[key_start + klen..key_start + klen + vlen],
        )
    }

    /// Index of the first entry with key >= target.
    fn lower_bound(&self, cmp: &dyn Comparator, target: &[u8]) -> usize {
        let mut lo = 0usize;
        let mut hi = self.offsets.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(self.entry(mid).0, target).is_lt() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn iter(self: &Arc<Self>, cmp: Arc<dyn Comparator>) -> BlockIterator {
        BlockIterator {
            block: Arc::clone(self),
            cmp,
            index: None,
        }
    }
}

/// Iterator over a single block's entries.
pub struct BlockIterator {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    index: Option<usize>,
}

impl StorageIterator for BlockIterator {
    fn key(&self) -> &[u8] {
        self.block.entry(self.index.unwrap()).0
    }

    fn value(&self) -> &[u8] {
        self.block.entry(self.index.unwrap()).1
    }

    fn is_valid(&self) -> bool {
        self.index.is_some()
    }

    fn next(&mut self) -> Result<()> {
        self.index = match self.index {
            Some(i) if i + 1 < self.block.len() => Some(i + 1),
            _ => None,
        };
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        self.index = match self.index {
            Some(i) if i > 0 => Some(i - 1),
            _ => None,
        };
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let i = self.block.lower_bound(self.cmp.as_ref(), key);
        self.index = if i < self.block.len() { Some(i) } else { None };
        Ok(())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.index = if self.block.is_empty() { None } else { Some(0) };
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.index = self.block.len().checked_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::sstable::block::builder::BlockBuilder;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut b = BlockBuilder::new(1 << 20, restart_interval);
        for (k, v) in entries {
            assert!(b.add(k, v));
        }
        Arc::new(Block::parse(Arc::new(b.build())).unwrap())
    }

    #[test]
    fn parse_and_read_back() {
        let block = build_block(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")], 2);
        assert_eq!(block.len(), 3);
        assert_eq!(block.entry(1), (b"b".as_slice(), b"2".as_slice()));
    }

    #[test]
    fn seek_lands_on_lower_bound() {
        let block = build_block(&[(b"apple", b"1"), (b"mango", b"2"), (b"pear", b"3")], 1);
        let mut it = block.iter(Arc::new(BytewiseComparator));
        it.seek(b"banana").unwrap();
        assert_eq!(it.key(), b"mango");
        it.seek(b"pear").unwrap();
        assert_eq!(it.key(), b"pear");
        it.seek(b"zebra").unwrap();
        assert!(!it.is_valid());
    }

    #[test]
    fn forward_and_backward_iteration() {
        let block = build_block(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")], 4);
        let mut it = block.iter(Arc::new(BytewiseComparator));
        it.seek_to_first().unwrap();
        assert_eq!(it.key(), b"a");
        it.next().unwrap();
        it.next().unwrap();
        assert_eq!(it.key(), b"c");
        it.next().unwrap();
        assert!(!it.is_valid());

        it.seek_to_last().unwrap();
        assert_eq!(it.key(), b"c");
        it.prev().unwrap();
        assert_eq!(it.key(), b"b");
        it.prev().unwrap();
        it.prev().unwrap();
        assert!(!it.is_valid());
    }

    #[test]
    fn corrupt_trailer_rejected() {
        let mut b = BlockBuilder::new(1 << 20, 1);
        b.add(b"k", b"v");
        let mut bytes = b.build();
        let n = bytes.len();
        bytes[n - 1] = 0xFF; // wreck the entry count
        assert!(Block::parse(Arc::new(bytes)).is_err());
    }

    #[test]
    fn truncated_block_rejected() {
        assert!(Block::parse(Arc::new(vec![0u8; 3])).is_err());
    }
}
