use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::StorageIterator;
use crate::sstable::block::reader::BlockIterator;
use crate::sstable::reader::Table;

/// Two-level iterator over a sorted file: an index cursor selects data
/// blocks, a block iterator walks entries within the selected block.
/// Seek cost is O(log blocks) + O(log entries-in-block).
pub struct TableIterator {
    table: Arc<Table>,
    verify: bool,
    fill_cache: bool,
    /// Current position in the index (current data block), if any.
    block_index: Option<usize>,
    block_iter: Option<BlockIterator>,
}

enum BlockPosition<'a> {
    First,
    Last,
    LowerBound(&'a [u8]),
}

impl TableIterator {
    pub fn new(table: Arc<Table>, verify: bool, fill_cache: bool) -> Self {
        TableIterator {
            table,
            verify,
            fill_cache,
            block_index: None,
            block_iter: None,
        }
    }

    fn clear(&mut self) {
        self.block_index = None;
        self.block_iter = None;
    }

    fn load_block(&mut self, index: usize, position: BlockPosition<'_>) -> Result<()> {
        let block = self.table.read_block(index, self.verify, self.fill_cache)?;
        let mut it = block.iter(self.table.icmp() as Arc<dyn Comparator>);
        match position {
            BlockPosition::First => it.seek_to_first()?,
            BlockPosition::Last => it.seek_to_last()?,
            BlockPosition::LowerBound(key) => it.seek(key)?,
        }
        self.block_index = Some(index);
        self.block_iter = Some(it);
        Ok(())
    }
}

impl StorageIterator for TableIterator {
    fn key(&self) -> &[u8] {
        self.block_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.block_iter.as_ref().unwrap().value()
    }

    fn is_valid(&self) -> bool {
        self.block_iter.as_ref().is_some_and(|it| it.is_valid())
    }

    fn next(&mut self) -> Result<()> {
        let Some(index) = self.block_index else {
            return Ok(());
        };
        if let Some(it) = &mut self.block_iter {
            it.next()?;
            if it.is_valid() {
                return Ok(());
            }
        }
        // Exhausted this block; move to the next one.
        if index + 1 < self.table.num_blocks() {
            self.load_block(index + 1, BlockPosition::First)
        } else {
            self.clear();
            Ok(())
        }
    }

    fn prev(&mut self) -> Result<()> {
        let Some(index) = self.block_index else {
            return Ok(());
        };
        if let Some(it) = &mut self.block_iter {
            it.prev()?;
            if it.is_valid() {
                return Ok(());
            }
        }
        if index > 0 {
            self.load_block(index - 1, BlockPosition::Last)
        } else {
            self.clear();
            Ok(())
        }
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        match self.table.index_lower_bound(key) {
            Some(index) => {
                self.load_block(index, BlockPosition::LowerBound(key))?;
                // The target block's last key is >= target, so the seek
                // inside it always lands on an entry.
                Ok(())
            }
            None => {
                self.clear();
                Ok(())
            }
        }
    }

    fn seek_to_first(&mut self) -> Result<()> {
        if self.table.num_blocks() == 0 {
            self.clear();
            return Ok(());
        }
        self.load_block(0, BlockPosition::First)
    }

    fn seek_to_last(&mut self) -> Result<()> {
        let n = self.table.num_blocks();
        if n == 0 {
            self.clear();
            return Ok(());
        }
        self.load_block(n - 1, BlockPosition::Last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::env::{LocalEnv, StorageEnv};
    use crate::sstable::TableConfig;
    use crate::sstable::builder::TableBuilder;
    use crate::types::{MAX_SEQUENCE, ValueType, encode_internal_key, extract_user_key, lookup_key};
    use tempfile::tempdir;

    fn open_table(n: u32, block_size: usize) -> (tempfile::TempDir, Arc<Table>) {
        let cfg = TableConfig {
            block_size,
            ..TableConfig::default()
        };
        let dir = tempdir().unwrap();
        let env = LocalEnv::new(dir.path()).unwrap();
        let dest = env.create_region("000004.sst").unwrap();
        let mut b = TableBuilder::new(dest, cfg.clone());
        for i in 0..n {
            let key = encode_internal_key(format!("key_{i:04}").as_bytes(), 3, ValueType::Put);
            b.add(&key, format!("v{i}").as_bytes()).unwrap();
        }
        b.finish().unwrap();
        let region = env.open_region("000004.sst").unwrap();
        let icmp = Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)));
        let table = Arc::new(Table::open(4, region, icmp, cfg, None).unwrap());
        (dir, table)
    }

    #[test]
    fn seek_crosses_block_boundaries() {
        let (_dir, table) = open_table(100, 128);
        let mut it = TableIterator::new(table, true, false);
        it.seek(&lookup_key(b"key_0077", MAX_SEQUENCE)).unwrap();
        assert_eq!(extract_user_key(it.key()), b"key_0077");
        it.next().unwrap();
        assert_eq!(extract_user_key(it.key()), b"key_0078");
    }

    #[test]
    fn backward_scan_from_last() {
        let (_dir, table) = open_table(30, 64);
        let mut it = TableIterator::new(table, true, false);
        it.seek_to_last().unwrap();
        let mut keys = Vec::new();
        while it.is_valid() {
            keys.push(extract_user_key(it.key()).to_vec());
            it.prev().unwrap();
        }
        assert_eq!(keys.len(), 30);
        let mut forward = keys.clone();
        forward.sort();
        forward.reverse();
        assert_eq!(keys, forward);
    }

    #[test]
    fn seek_past_end_is_invalid() {
        let (_dir, table) = open_table(10, 4096);
        let mut it = TableIterator::new(table, true, false);
        it.seek(&lookup_key(b"nope", MAX_SEQUENCE)).unwrap();
        assert!(!it.is_valid());
    }
}
