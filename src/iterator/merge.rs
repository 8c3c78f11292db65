use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::StorageIterator;

/// Merges multiple sorted iterators into a single sorted stream.
///
/// Used for:
/// - Range scans across the write buffer + all sorted-file levels
/// - Compaction (merging input files)
///
/// Entries are yielded in internal-key order (user_key ASC, sequence DESC).
/// No deduplication or tombstone handling happens here; the database
/// iterator and the compaction loop apply their own visibility rules.
/// Children must be listed newest source first — ties on the full internal
/// key break toward the lower child index, keeping duplicate resolution
/// deterministic.
pub struct MergeIterator {
    cmp: Arc<dyn Comparator>,
    children: Vec<Box<dyn StorageIterator>>,
    current: Option<usize>,
    direction: Direction,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

impl MergeIterator {
    pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn StorageIterator>>) -> Self {
        MergeIterator {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.is_valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.cmp.compare(child.key(), self.children[s].key()).is_lt() {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.is_valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.cmp.compare(child.key(), self.children[l].key()).is_ge() {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl StorageIterator for MergeIterator {
    fn key(&self) -> &[u8] {
        self.children[self.current.unwrap()].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.unwrap()].value()
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };

        // After a direction switch the non-current children sit at entries
        // before the current key; bring them forward so every child is
        // positioned past it.
        if self.direction == Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key)?;
                if child.is_valid() && self.cmp.compare(child.key(), &key).is_eq() {
                    child.next()?;
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next()?;
        self.find_smallest();
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };

        if self.direction == Direction::Forward {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                // Position each child at the last entry strictly before key.
                child.seek(&key)?;
                if child.is_valid() {
                    child.prev()?;
                } else {
                    child.seek_to_last()?;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev()?;
        self.find_largest();
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek(key)?;
        }
        self.direction = Direction::Forward;
        self.find_smallest();
        Ok(())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_first()?;
        }
        self.direction = Direction::Forward;
        self.find_smallest();
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_last()?;
        }
        self.direction = Direction::Reverse;
        self.find_largest();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::memtable::MemTable;
    use crate::types::{MAX_SEQUENCE, ValueType, extract_sequence, extract_user_key, lookup_key};

    fn icmp() -> Arc<InternalKeyComparator> {
        Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn table_with(entries: &[(u64, &[u8], &[u8])]) -> Arc<MemTable> {
        let mt = Arc::new(MemTable::new(icmp()));
        for (seq, k, v) in entries {
            mt.add(*seq, ValueType::Put, k, v);
        }
        mt
    }

    fn merged(tables: &[Arc<MemTable>]) -> MergeIterator {
        let children: Vec<Box<dyn StorageIterator>> = tables
            .iter()
            .map(|t| Box::new(t.iter()) as Box<dyn StorageIterator>)
            .collect();
        MergeIterator::new(icmp() as Arc<dyn Comparator>, children)
    }

    #[test]
    fn merges_disjoint_sources_in_order() {
        let a = table_with(&[(1, b"a", b"1"), (3, b"c", b"3")]);
        let b = table_with(&[(2, b"b", b"2"), (4, b"d", b"4")]);
        let mut it = merged(&[a, b]);
        it.seek_to_first().unwrap();
        let mut keys = Vec::new();
        while it.is_valid() {
            keys.push(extract_user_key(it.key()).to_vec());
            it.next().unwrap();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn duplicate_user_keys_yield_newest_first() {
        let newer = table_with(&[(9, b"k", b"new")]);
        let older = table_with(&[(2, b"k", b"old")]);
        let mut it = merged(&[newer, older]);
        it.seek_to_first().unwrap();
        assert_eq!(extract_sequence(it.key()), 9);
        assert_eq!(it.value(), b"new");
        it.next().unwrap();
        assert_eq!(extract_sequence(it.key()), 2);
        it.next().unwrap();
        assert!(!it.is_valid());
    }

    #[test]
    fn seek_positions_all_children() {
        let a = table_with(&[(1, b"apple", b"1"), (2, b"pear", b"2")]);
        let b = table_with(&[(3, b"mango", b"3")]);
        let mut it = merged(&[a, b]);
        it.seek(&lookup_key(b"banana", MAX_SEQUENCE)).unwrap();
        assert_eq!(extract_user_key(it.key()), b"mango");
    }

    #[test]
    fn direction_switch_mid_stream() {
        let a = table_with(&[(1, b"a", b"1"), (3, b"c", b"3"), (5, b"e", b"5")]);
        let b = table_with(&[(2, b"b", b"2"), (4, b"d", b"4")]);
        let mut it = merged(&[a, b]);
        it.seek_to_first().unwrap();
        it.next().unwrap();
        it.next().unwrap();
        assert_eq!(extract_user_key(it.key()), b"c");
        it.prev().unwrap();
        assert_eq!(extract_user_key(it.key()), b"b");
        it.prev().unwrap();
        assert_eq!(extract_user_key(it.key()), b"a");
        it.next().unwrap();
        assert_eq!(extract_user_key(it.key()), b"b");
    }

    #[test]
    fn reverse_scan_yields_descending_order() {
        let a = table_with(&[(1, b"a", b"1"), (3, b"c", b"3")]);
        let b = table_with(&[(2, b"b", b"2")]);
        let mut it = merged(&[a, b]);
        it.seek_to_last().unwrap();
        let mut keys = Vec::new();
        while it.is_valid() {
            keys.push(extract_user_key(it.key()).to_vec());
            it.prev().unwrap();
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn empty_children_are_harmless() {
        let empty = table_with(&[]);
        let full = table_with(&[(1, b"x", b"v")]);
        let mut it = merged(&[empty, full]);
        it.seek_to_first().unwrap();
        assert_eq!(extract_user_key(it.key()), b"x");
        it.next().unwrap();
        assert!(!it.is_valid());
    }
}
