/// Accumulates sorted key-value pairs and serializes them into a block.
///
/// A block is typically 4KB (matching OS page size / network MTU-friendly
/// fetch sizes). Contains sorted entries plus restart offsets for seeking.
///
/// On-disk layout of a raw block (before compression and checksum wrap):
/// ```text
/// ┌──────────────────────────────────────────────────┐
/// │ Entry 0: [key_len(4B)][val_len(4B)][key][value]  │
/// │ Entry 1: ...                                     │
/// │ Entry N: ...                                     │
/// ├──────────────────────────────────────────────────┤
/// │ Restart offsets: [off(4B)] × num_restarts        │
/// │ Num restarts (4B)                                │
/// │ Num entries (4B)                                 │
/// └──────────────────────────────────────────────────┘
/// ```
///
/// A restart offset is recorded every `restart_interval` entries; readers
/// land on a restart point and scan forward from there.
pub struct BlockBuilder {
    data: Vec<u8>,
    restarts: Vec<u32>,
    count: usize,
    restart_interval: usize,
    block_size: usize,
}

impl BlockBuilder {
    pub fn new(block_size: usize, restart_interval: usize) -> Self {
        BlockBuilder {
            data: Vec::new(),
            restarts: Vec::new(),
            count: 0,
            restart_interval: restart_interval.max(1),
            block_size,
        }
    }

    /// Add a key-value pair to the block.
    /// Returns false if the block is full (entry doesn't fit).
    /// First entry is always accepted even if it exceeds block_size.
    /// Entries MUST be added in sorted key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> bool {
        let entry_size = 4 + 4 + key.len() + value.len();
        if self.count > 0 && self.estimated_size() + entry_size > self.block_size {
            return false;
        }

        if self.count % self.restart_interval == 0 {
            self.restarts.push(self.data.len() as u32);
        }

        self.data.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.data.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.data.extend_from_slice(key);
        self.data.extend_from_slice(value);
        self.count += 1;

        true
    }

    /// Finalize the block: append restart array and counts.
    pub fn build(self) -> Vec<u8> {
        let mut block = self.data;
        for offset in &self.restarts {
            block.extend_from_slice(&offset.to_le_bytes());
        }
        block.extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        block.extend_from_slice(&(self.count as u32).to_le_bytes());
        block
    }

    /// Current estimated size of the finished block.
    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.restarts.len() * 4 + 8
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_always_accepted() {
        let mut b = BlockBuilder::new(16, 1);
        assert!(b.add(b"a-rather-long-key", b"a-rather-long-value"));
        assert!(!b.add(b"b", b"v"));
    }

    #[test]
    fn restart_points_every_interval() {
        let mut b = BlockBuilder::new(1 << 16, 4);
        for i in 0..10u32 {
            assert!(b.add(format!("k{i}").as_bytes(), b"v"));
        }
        assert_eq!(b.restarts.len(), 3); // entries 0, 4, 8
    }

    #[test]
    fn build_appends_trailer() {
        let mut b = BlockBuilder::new(1 << 16, 1);
        b.add(b"k", b"v");
        let block = b.build();
        let n = block.len();
        let count = u32::from_le_bytes(block[n - 4..].try_into().unwrap());
        let restarts = u32::from_le_bytes(block[n - 8..n - 4].try_into().unwrap());
        assert_eq!(count, 1);
        assert_eq!(restarts, 1);
    }
}
