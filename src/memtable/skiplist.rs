use std::sync::Arc;

use rand::Rng;

use crate::comparator::Comparator;

/// Maximum height of the skip list.
pub const MAX_HEIGHT: usize = 12;

/// Each level is kept with probability 1/4. The higher branching factor
/// means fewer levels and less pointer memory than a 1/2 coin flip.
const BRANCHING: u32 = 4;

/// A single node in the skip list.
///
/// Nodes live in an append-only arena and point at each other by index, so
/// there is no unsafe pointer juggling and indices handed to iterators stay
/// valid for the lifetime of the list.
///
/// ```text
/// Level 3:  HEAD ──────────────────────────────► 50 ──────────► NIL
/// Level 2:  HEAD ──────────► 20 ────────────────► 50 ──────────► NIL
/// Level 1:  HEAD ──► 10 ──► 20 ────► 35 ────────► 50 ──► 60 ──► NIL
/// Level 0:  HEAD ──► 10 ──► 20 ──► 25 ──► 35 ──► 50 ──► 60 ──► 70 ► NIL
/// ```
struct SkipNode {
    key: Vec<u8>,
    value: Vec<u8>,
    /// Forward indices into the arena, one per level this node occupies.
    next: Vec<Option<u32>>,
}

/// A probabilistic sorted structure ordered by an injected comparator.
///
/// Keys here are encoded internal keys, so duplicates never occur — every
/// write carries a distinct sequence number.
///
/// Average case: O(log n) insert, O(log n) lookup, O(n) iteration.
pub struct SkipList {
    cmp: Arc<dyn Comparator>,
    /// arena[0] is the head sentinel (empty key, full height).
    arena: Vec<SkipNode>,
    height: usize,
    len: usize,
    size_bytes: usize,
}

impl SkipList {
    pub fn new(cmp: Arc<dyn Comparator>) -> Self {
        let head = SkipNode {
            key: Vec::new(),
            value: Vec::new(),
            next: vec![None; MAX_HEIGHT],
        };
        SkipList {
            cmp,
            arena: vec![head],
            height: 1,
            len: 0,
            size_bytes: 0,
        }
    }

    /// Insert a key-value pair. Keys must be unique (internal keys are).
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let mut prev = [0u32; MAX_HEIGHT];
        self.find_predecessors(&key, &mut prev);

        let node_height = random_height();
        if node_height > self.height {
            // Levels above the old height start from the head.
            for slot in prev.iter_mut().take(node_height).skip(self.height) {
                *slot = 0;
            }
            self.height = node_height;
        }

        self.size_bytes += key.len() + value.len() + node_height * size_of::<Option<u32>>();
        let new_index = self.arena.len() as u32;
        let mut next = Vec::with_capacity(node_height);
        for (level, &p) in prev.iter().enumerate().take(node_height) {
            next.push(self.arena[p as usize].next[level]);
        }
        self.arena.push(SkipNode { key, value, next });
        for (level, &p) in prev.iter().enumerate().take(node_height) {
            self.arena[p as usize].next[level] = Some(new_index);
        }
        self.len += 1;
    }

    /// Index of the first node with key >= target, if any.
    pub fn seek(&self, target: &[u8]) -> Option<u32> {
        let mut prev = [0u32; MAX_HEIGHT];
        self.find_predecessors(target, &mut prev);
        self.arena[prev[0] as usize].next[0]
    }

    /// Index of the last node with key < target, if any real node qualifies.
    pub fn seek_before(&self, target: &[u8]) -> Option<u32> {
        let mut prev = [0u32; MAX_HEIGHT];
        self.find_predecessors(target, &mut prev);
        if prev[0] == 0 { None } else { Some(prev[0]) }
    }

    /// Index of the first real node.
    pub fn first(&self) -> Option<u32> {
        self.arena[0].next[0]
    }

    /// Index of the last real node.
    pub fn last(&self) -> Option<u32> {
        let mut level = self.height;
        let mut node = 0u32;
        loop {
            level -= 1;
            while let Some(next) = self.arena[node as usize].next[level] {
                node = next;
            }
            if level == 0 {
                break;
            }
        }
        if node == 0 { None } else { Some(node) }
    }

    /// Successor of a node at level 0.
    pub fn next_of(&self, index: u32) -> Option<u32> {
        self.arena[index as usize].next[0]
    }

    /// Key/value of a node. Index must come from this list.
    pub fn entry(&self, index: u32) -> (&[u8], &[u8]) {
        let node = &self.arena[index as usize];
        (&node.key, &node.value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Approximate memory usage in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Fill `prev` with, per level, the last node whose key < target.
    fn find_predecessors(&self, target: &[u8], prev: &mut [u32; MAX_HEIGHT]) {
        let mut node = 0u32;
        for level in (0..self.height).rev() {
            while let Some(next) = self.arena[node as usize].next[level] {
                if self
                    .cmp
                    .compare(&self.arena[next as usize].key, target)
                    .is_lt()
                {
                    node = next;
                } else {
                    break;
                }
            }
            prev[level] = node;
        }
        // Levels at or above self.height keep whatever the caller seeded;
        // insert() fixes them up when the list grows.
        for slot in prev.iter_mut().skip(self.height) {
            *slot = 0;
        }
    }
}

/// Coin-flip level assignment: each level survives with probability 1/BRANCHING.
fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING) {
        height += 1;
    }
    height
}
