use crate::env::WritableRegion;
use crate::error::{Error, Result};
use crate::sstable::block::builder::BlockBuilder;
use crate::sstable::footer::{Footer, IndexEntry, TABLE_MAGIC};
use crate::sstable::{TableConfig, wrap_block};
use crate::types::extract_user_key;

/// Summary of a finished sorted file, enough for the version edit that
/// installs it.
#[derive(Debug, Clone)]
pub struct TableHandle {
    pub file_size: u64,
    pub entry_count: u64,
    /// Smallest internal key in the file.
    pub smallest: Vec<u8>,
    /// Largest internal key in the file.
    pub largest: Vec<u8>,
}

/// Builds a sorted file from a stream of internal entries in sorted order.
///
/// Used during:
/// - Write-buffer flush (sealed memtable → level-0 file)
/// - Compaction (merged iterators → new files)
///
/// Build process:
/// 1. Add entries one by one (must be in internal-key order)
/// 2. Entries fill blocks; a full block is wrapped (compression + CRC) and
///    appended to the destination region
/// 3. finish() flushes the last block, writes filter + index blocks and the
///    footer, then finalizes the region (fsync locally, capability-token
///    finalize remotely)
pub struct TableBuilder {
    dest: Box<dyn WritableRegion>,
    cfg: TableConfig,
    block: BlockBuilder,
    index_entries: Vec<IndexEntry>,
    /// User keys seen, for the filter block.
    filter_keys: Vec<Vec<u8>>,
    offset: u64,
    entry_count: u64,
    smallest: Option<Vec<u8>>,
    largest: Option<Vec<u8>>,
    last_key_in_block: Option<Vec<u8>>,
}

impl TableBuilder {
    pub fn new(dest: Box<dyn WritableRegion>, cfg: TableConfig) -> Self {
        let block = BlockBuilder::new(cfg.block_size, cfg.block_restart_interval);
        TableBuilder {
            dest,
            cfg,
            block,
            index_entries: Vec::new(),
            filter_keys: Vec::new(),
            offset: 0,
            entry_count: 0,
            smallest: None,
            largest: None,
            last_key_in_block: None,
        }
    }

    /// Add an internal entry. MUST be called in sorted internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.smallest.is_none() {
            self.smallest = Some(key.to_vec());
        }
        self.largest = Some(key.to_vec());
        self.entry_count += 1;
        if self.cfg.filter_policy.is_some() {
            self.filter_keys.push(extract_user_key(key).to_vec());
        }

        if self.block.add(key, value) {
            self.last_key_in_block = Some(key.to_vec());
            return Ok(());
        }

        // Block is full — flush it, then add to a fresh block.
        self.flush_block()?;
        if !self.block.add(key, value) {
            // First entry into an empty block is always accepted.
            return Err(Error::InvalidArgument(format!(
                "entry of {} bytes rejected by empty block",
                key.len() + value.len()
            )));
        }
        self.last_key_in_block = Some(key.to_vec());
        Ok(())
    }

    /// Bytes written so far plus the current in-progress block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.estimated_size() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let old = std::mem::replace(
            &mut self.block,
            BlockBuilder::new(self.cfg.block_size, self.cfg.block_restart_interval),
        );
        let physical = wrap_block(&old.build(), self.cfg.compression)?;
        self.dest.append(&physical)?;

        self.index_entries.push(IndexEntry {
            // add() always records the key before a block can be flushed.
            last_key: self.last_key_in_block.take().unwrap_or_default(),
            offset: self.offset,
            size: physical.len() as u64,
        });
        self.offset += physical.len() as u64;
        Ok(())
    }

    /// Finalize: flush last block, write filter block, index block, footer.
    pub fn finish(mut self) -> Result<TableHandle> {
        self.flush_block()?;

        // Filter block (uncompressed, CRC-wrapped like any block payload).
        // The freshly built filter is probed with every key it covers; a
        // policy that would deny a present key gets no filter block at all,
        // so a broken policy costs block reads, never lost keys.
        let (filter_offset, filter_size) = match &self.cfg.filter_policy {
            Some(policy) if !self.filter_keys.is_empty() => {
                let keys: Vec<&[u8]> = self.filter_keys.iter().map(|k| k.as_slice()).collect();
                let filter = policy.create_filter(&keys);
                if keys.iter().all(|k| policy.key_may_match(k, &filter)) {
                    let physical = wrap_block(&filter, crate::sstable::CompressionKind::None)?;
                    self.dest.append(&physical)?;
                    let span = (self.offset, physical.len() as u64);
                    self.offset += physical.len() as u64;
                    span
                } else {
                    log::warn!("filter policy {} denied a covered key, filter dropped", policy.name());
                    (0, 0)
                }
            }
            _ => (0, 0),
        };

        // Index block: serialized entries back to back, CRC-wrapped.
        let mut index_data = Vec::new();
        for entry in &self.index_entries {
            index_data.extend_from_slice(&entry.encode());
        }
        let physical = wrap_block(&index_data, crate::sstable::CompressionKind::None)?;
        let index_offset = self.offset;
        let index_size = physical.len() as u64;
        self.dest.append(&physical)?;
        self.offset += index_size;

        let footer = Footer {
            index_offset,
            index_size,
            filter_offset,
            filter_size,
            entry_count: self.entry_count,
            magic: TABLE_MAGIC,
        };
        self.dest.append(&footer.encode())?;
        self.offset += Footer::SIZE as u64;

        // Durability / remote visibility barrier. A reader may only observe
        // the region after this returns.
        self.dest.finalize()?;

        Ok(TableHandle {
            file_size: self.offset,
            entry_count: self.entry_count,
            smallest: self.smallest.unwrap_or_default(),
            largest: self.largest.unwrap_or_default(),
        })
    }
}
