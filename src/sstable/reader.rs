use std::sync::Arc;

use crate::cache::{BlockCache, BlockKey};
use crate::comparator::{Comparator, InternalKeyComparator};
use crate::env::ReadableRegion;
use crate::error::{Error, Result};
use crate::sstable::block::reader::Block;
use crate::sstable::footer::{Footer, IndexEntry};
use crate::sstable::{TableConfig, unwrap_block};
use crate::types::extract_user_key;

/// An opened sorted file. Supports point lookups and range scans.
///
/// On open:
/// 1. Read footer (last 56 bytes of the region) → locate index and filter
/// 2. Read and parse index block → Vec<IndexEntry>
/// 3. Read the filter block, if present
/// 4. Ready for queries (data blocks fetched on demand)
///
/// Whether the region is a local file or registered memory on a remote node
/// is invisible here — only latency differs. Checksum verification is
/// applied on every block fetch when the read asks for it; footer, index
/// and filter are always verified at open time.
pub struct Table {
    file_number: u64,
    region: Arc<dyn ReadableRegion>,
    icmp: Arc<InternalKeyComparator>,
    cfg: TableConfig,
    cache: Option<Arc<BlockCache>>,
    index: Vec<IndexEntry>,
    filter: Option<Vec<u8>>,
    entry_count: u64,
}

impl Table {
    pub fn open(
        file_number: u64,
        region: Arc<dyn ReadableRegion>,
        icmp: Arc<InternalKeyComparator>,
        cfg: TableConfig,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let len = region.len();
        if len < Footer::SIZE as u64 {
            return Err(Error::Corruption(format!(
                "region too short for footer: {len} bytes"
            )));
        }
        let tail = region.read_at(len - Footer::SIZE as u64, Footer::SIZE)?;
        let footer = Footer::decode(&tail)?;

        if footer.index_offset + footer.index_size > len {
            return Err(Error::Corruption("index block outside region".into()));
        }
        let physical = region.read_at(footer.index_offset, footer.index_size as usize)?;
        let index_data = unwrap_block(&physical, true)?;
        let mut index = Vec::new();
        let mut pos = 0;
        while pos < index_data.len() {
            let (entry, consumed) = IndexEntry::decode(&index_data[pos..])?;
            index.push(entry);
            pos += consumed;
        }

        let filter = if footer.filter_size > 0 {
            if footer.filter_offset + footer.filter_size > len {
                return Err(Error::Corruption("filter block outside region".into()));
            }
            let physical = region.read_at(footer.filter_offset, footer.filter_size as usize)?;
            Some(unwrap_block(&physical, true)?)
        } else {
            None
        };

        Ok(Table {
            file_number,
            region,
            icmp,
            cfg,
            cache,
            index,
            filter,
            entry_count: footer.entry_count,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn file_size(&self) -> u64 {
        self.region.len()
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn icmp(&self) -> Arc<InternalKeyComparator> {
        Arc::clone(&self.icmp)
    }

    /// Offset of block `i` within the region; used for size estimates.
    pub(crate) fn block_offset(&self, i: usize) -> u64 {
        self.index[i].offset
    }

    /// Approximate byte offset of `ikey` within the file.
    pub fn approximate_offset_of(&self, ikey: &[u8]) -> u64 {
        match self.index_lower_bound(ikey) {
            Some(i) => self.block_offset(i),
            None => self.region.len(),
        }
    }

    /// Index of the first block whose last key >= target, if any.
    pub(crate) fn index_lower_bound(&self, target: &[u8]) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.index.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self
                .icmp
                .compare(&self.index[mid].last_key, target)
                .is_lt()
            {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo < self.index.len()).then_some(lo)
    }

    /// Fetch and parse block `i`, consulting the block cache.
    pub(crate) fn read_block(&self, i: usize, verify: bool, fill_cache: bool) -> Result<Arc<Block>> {
        let entry = &self.index[i];
        let key = BlockKey {
            file_number: self.file_number,
            offset: entry.offset,
        };

        if let Some(cache) = &self.cache {
            if let Some(raw) = cache.get(&key) {
                return Ok(Arc::new(Block::parse(raw)?));
            }
        }

        let physical = self.region.read_at(entry.offset, entry.size as usize)?;
        let raw = Arc::new(unwrap_block(&physical, verify)?);
        if fill_cache {
            if let Some(cache) = &self.cache {
                cache.insert(key, Arc::clone(&raw));
            }
        }
        Ok(Arc::new(Block::parse(raw)?))
    }

    /// Seek to the first entry with internal key >= `ikey`.
    ///
    /// Returns the entry as owned bytes, or None if every entry is smaller
    /// or the filter rules the user key out. The filter is advisory: a
    /// negative probe only skips work, it never invents a miss for a key
    /// the file actually holds (false negatives are a policy contract
    /// violation, checked by the property tests).
    pub fn get(&self, ikey: &[u8], verify: bool, fill_cache: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let (Some(policy), Some(filter)) = (&self.cfg.filter_policy, &self.filter) {
            if !policy.key_may_match(extract_user_key(ikey), filter) {
                return Ok(None);
            }
        }
        let Some(block_idx) = self.index_lower_bound(ikey) else {
            return Ok(None);
        };
        let block = self.read_block(block_idx, verify, fill_cache)?;
        let mut it = block.iter(self.icmp.clone() as Arc<dyn Comparator>);
        it.seek(ikey)?;
        use crate::iterator::StorageIterator;
        if it.is_valid() {
            Ok(Some((it.key().to_vec(), it.value().to_vec())))
        } else {
            Ok(None)
        }
    }
}
