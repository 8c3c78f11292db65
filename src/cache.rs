//! LRU caches for sorted-file data.
//!
//! The block cache holds decoded data blocks keyed by (file number, block
//! offset) and is sharded for concurrency. Remote reads make this cache
//! earn its keep twice over: a hit saves a network round trip, not just a
//! disk seek. The table cache bounds how many sorted files are held open
//! (index + filter resident) at once, per `max_open_files`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;

const NUM_SHARDS: usize = 16;

/// Unique identifier for a cached block: (sorted file number, block offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub file_number: u64,
    pub offset: u64,
}

struct Shard {
    map: HashMap<BlockKey, Arc<Vec<u8>>>,
    /// LRU order, most recent at the back. Stale keys are skipped on evict.
    order: VecDeque<BlockKey>,
    bytes: usize,
}

impl Shard {
    fn evict_to(&mut self, budget: usize, evictions: &AtomicU64) {
        while self.bytes > budget {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            // A later occurrence means the entry was promoted since; this
            // position is stale.
            if self.order.contains(&victim) {
                continue;
            }
            if let Some(block) = self.map.remove(&victim) {
                self.bytes -= block.len();
                evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Sharded LRU block cache with a fixed byte budget.
pub struct BlockCache {
    shards: Vec<Mutex<Shard>>,
    shard_budget: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlockCache {
    pub fn new(capacity_bytes: usize) -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| {
                Mutex::new(Shard {
                    map: HashMap::new(),
                    order: VecDeque::new(),
                    bytes: 0,
                })
            })
            .collect();
        BlockCache {
            shards,
            shard_budget: (capacity_bytes / NUM_SHARDS).max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard_of(&self, key: &BlockKey) -> &Mutex<Shard> {
        let h = key.file_number.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ key.offset;
        &self.shards[(h as usize) % NUM_SHARDS]
    }

    pub fn get(&self, key: &BlockKey) -> Option<Arc<Vec<u8>>> {
        let mut shard = self.shard_of(key).lock();
        if let Some(block) = shard.map.get(key).cloned() {
            shard.order.push_back(*key);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(block)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn insert(&self, key: BlockKey, block: Arc<Vec<u8>>) {
        if block.len() > self.shard_budget {
            return;
        }
        let mut shard = self.shard_of(&key).lock();
        if let Some(old) = shard.map.insert(key, block.clone()) {
            shard.bytes -= old.len();
        }
        shard.bytes += block.len();
        shard.order.push_back(key);
        let budget = self.shard_budget;
        shard.evict_to(budget, &self.evictions);
    }

    /// Drop every block belonging to a deleted file.
    pub fn erase_file(&self, file_number: u64) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let dead: Vec<BlockKey> = shard
                .map
                .keys()
                .filter(|k| k.file_number == file_number)
                .copied()
                .collect();
            for key in dead {
                if let Some(block) = shard.map.remove(&key) {
                    shard.bytes -= block.len();
                }
            }
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Bounds the number of concurrently open sorted files.
///
/// Opening a table parses its footer, index, and filter — for a remote
/// region that is several round trips, so open readers are worth caching.
pub struct TableCache {
    inner: Mutex<TableCacheInner>,
    capacity: usize,
}

struct TableCacheInner {
    map: HashMap<u64, Arc<crate::sstable::reader::Table>>,
    order: VecDeque<u64>,
}

impl TableCache {
    pub fn new(capacity: usize) -> Self {
        TableCache {
            inner: Mutex::new(TableCacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Look up an open table, or open it via `open` and remember it.
    pub fn get_or_open<F>(&self, file_number: u64, open: F) -> Result<Arc<crate::sstable::reader::Table>>
    where
        F: FnOnce() -> Result<Arc<crate::sstable::reader::Table>>,
    {
        {
            let mut inner = self.inner.lock();
            if let Some(table) = inner.map.get(&file_number).cloned() {
                inner.order.push_back(file_number);
                return Ok(table);
            }
        }
        // Open outside the lock; transport round trips must not serialize
        // unrelated lookups.
        let table = open()?;
        let mut inner = self.inner.lock();
        inner.map.entry(file_number).or_insert_with(|| table.clone());
        inner.order.push_back(file_number);
        while inner.map.len() > self.capacity {
            let Some(victim) = inner.order.pop_front() else {
                break;
            };
            // Only evict keys whose most recent use is this stale entry.
            if !inner.order.contains(&victim) {
                inner.map.remove(&victim);
            }
        }
        Ok(table)
    }

    /// Forget a deleted file's reader.
    pub fn evict(&self, file_number: u64) {
        let mut inner = self.inner.lock();
        inner.map.remove(&file_number);
    }
}
