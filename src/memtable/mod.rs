pub mod skiplist;

use std::sync::Arc;

use parking_lot::RwLock;

use skiplist::SkipList;

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::error::Result;
use crate::iterator::StorageIterator;
use crate::types::{
    self, Value, ValueType, encode_internal_key, extract_user_key, lookup_key,
};

/// Outcome of a memtable (or sorted file) point lookup.
///
/// A tombstone is a definitive answer — the search must NOT continue into
/// older data, so "deleted" is distinct from "never heard of this key."
pub enum LookupResult {
    Value(Value),
    Deleted,
}

/// In-memory sorted write buffer. Wraps an arena skip list keyed by encoded
/// internal keys.
///
/// Every write goes here first. When the approximate footprint exceeds the
/// configured threshold the table is sealed (becomes immutable) and handed
/// to the flush pool, while a fresh table takes over the write path.
///
/// Concurrency: the DB's write path serializes mutators, so the lock is
/// only ever contended reader-vs-writer. Readers scan concurrently; the
/// arena only appends, so node indices held by iterators stay valid across
/// lock releases.
pub struct MemTable {
    list: RwLock<SkipList>,
    cmp: Arc<InternalKeyComparator>,
}

impl MemTable {
    pub fn new(cmp: Arc<InternalKeyComparator>) -> Self {
        MemTable {
            list: RwLock::new(SkipList::new(cmp.clone() as Arc<dyn Comparator>)),
            cmp,
        }
    }

    /// Insert an entry. `value` is ignored for tombstones.
    pub fn add(&self, sequence: u64, value_type: ValueType, user_key: &[u8], value: &[u8]) {
        let key = encode_internal_key(user_key, sequence, value_type);
        let value = match value_type {
            ValueType::Put => value.to_vec(),
            ValueType::Delete => Vec::new(),
        };
        self.list.write().insert(key, value);
    }

    /// Most recent entry for `user_key` with sequence <= `sequence`.
    pub fn get(&self, user_key: &[u8], sequence: u64) -> Option<LookupResult> {
        let list = self.list.read();
        let target = lookup_key(user_key, sequence);
        let idx = list.seek(&target)?;
        let (ikey, value) = list.entry(idx);
        let ucmp = self.cmp.user_comparator();
        if ucmp.compare(extract_user_key(ikey), user_key).is_ne() {
            return None;
        }
        match types::unpack_tag(types::extract_tag(ikey)) {
            Ok((_, ValueType::Put)) => Some(LookupResult::Value(value.to_vec())),
            Ok((_, ValueType::Delete)) => Some(LookupResult::Deleted),
            // The memtable only ever stores tags it encoded itself.
            Err(_) => None,
        }
    }

    /// Approximate memory footprint in bytes.
    pub fn approximate_size(&self) -> usize {
        self.list.read().size_bytes()
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Lazy, restartable iterator over all entries as of each step.
    /// Entries inserted behind the cursor are invisible; entries inserted
    /// ahead carry newer sequences and are filtered out by the read's
    /// snapshot, so the view stays consistent.
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            table: Arc::clone(self),
            node: None,
            current: None,
        }
    }
}

/// Iterator over memtable entries in internal-key order.
///
/// Holds an Arc to the table plus an arena index; each step takes the read
/// lock briefly and copies the entry out, so no lock is held between steps.
pub struct MemTableIterator {
    table: Arc<MemTable>,
    node: Option<u32>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemTableIterator {
    fn load(&mut self, list: &SkipList) {
        self.current = self.node.map(|idx| {
            let (k, v) = list.entry(idx);
            (k.to_vec(), v.to_vec())
        });
    }
}

impl StorageIterator for MemTableIterator {
    fn key(&self) -> &[u8] {
        &self.current.as_ref().unwrap().0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().unwrap().1
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        let table = Arc::clone(&self.table);
        let list = table.list.read();
        self.node = match self.node {
            Some(idx) => list.next_of(idx),
            None => None,
        };
        self.load(&list);
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        let table = Arc::clone(&self.table);
        let list = table.list.read();
        // No back pointers in the arena list; re-seek for the predecessor.
        self.node = match &self.current {
            Some((key, _)) => list.seek_before(key),
            None => None,
        };
        self.load(&list);
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let table = Arc::clone(&self.table);
        let list = table.list.read();
        self.node = list.seek(key);
        self.load(&list);
        Ok(())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        let table = Arc::clone(&self.table);
        let list = table.list.read();
        self.node = list.first();
        self.load(&list);
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        let table = Arc::clone(&self.table);
        let list = table.list.read();
        self.node = list.last();
        self.load(&list);
        Ok(())
    }
}
