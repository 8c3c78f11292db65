//! The sorted file layer.
//!
//! An immutable, block-structured, sorted run of internal entries with an
//! embedded index, optional bloom filter, and per-block checksums. Files
//! are written and read through [`crate::env`] regions, so the same code
//! serves local files and remote registered memory.

pub mod block;
pub mod builder;
pub mod footer;
pub mod iterator;
pub mod reader;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::filter::FilterPolicy;

/// Per-block compression applied when a block is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionKind {
    #[default]
    None,
    Zstd,
}

/// Knobs the table builder and reader need from the engine configuration.
#[derive(Clone)]
pub struct TableConfig {
    pub block_size: usize,
    pub block_restart_interval: usize,
    pub compression: CompressionKind,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            block_size: 4096,
            block_restart_interval: 16,
            compression: CompressionKind::None,
            filter_policy: None,
        }
    }
}

const BLOCK_TRAILER_SIZE: usize = 5; // kind byte + crc32

/// Wrap raw block contents for storage: optionally compress, then append
/// the kind byte and a crc32 over payload + kind.
///
/// Zstd is only kept when it actually shrinks the block; incompressible
/// blocks fall back to the stored-as-is kind.
pub(crate) fn wrap_block(raw: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    let (mut payload, kind_byte) = match kind {
        CompressionKind::None => (raw.to_vec(), 0u8),
        CompressionKind::Zstd => {
            let compressed = zstd::bulk::compress(raw, 3)?;
            if compressed.len() + 4 < raw.len() {
                let mut payload = Vec::with_capacity(4 + compressed.len());
                payload.extend_from_slice(&(raw.len() as u32).to_le_bytes());
                payload.extend_from_slice(&compressed);
                (payload, 1u8)
            } else {
                (raw.to_vec(), 0u8)
            }
        }
    };
    payload.push(kind_byte);
    let crc = crc32fast::hash(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    Ok(payload)
}

/// Undo [`wrap_block`]: verify the checksum (when asked), decompress.
pub(crate) fn unwrap_block(physical: &[u8], verify: bool) -> Result<Vec<u8>> {
    if physical.len() < BLOCK_TRAILER_SIZE {
        return Err(Error::Corruption("block smaller than its trailer".into()));
    }
    let crc_start = physical.len() - 4;
    if verify {
        let stored = u32::from_le_bytes(physical[crc_start..].try_into().unwrap());
        let computed = crc32fast::hash(&physical[..crc_start]);
        if stored != computed {
            return Err(Error::Corruption(format!(
                "block CRC mismatch: stored {stored:#x}, computed {computed:#x}"
            )));
        }
    }
    let kind_byte = physical[crc_start - 1];
    let payload = &physical[..crc_start - 1];
    match kind_byte {
        0 => Ok(payload.to_vec()),
        1 => {
            if payload.len() < 4 {
                return Err(Error::Corruption("compressed block missing length".into()));
            }
            let raw_len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
            let raw = zstd::bulk::decompress(&payload[4..], raw_len)
                .map_err(|e| Error::Corruption(format!("zstd decompress failed: {e}")))?;
            if raw.len() != raw_len {
                return Err(Error::Corruption("decompressed length mismatch".into()));
            }
            Ok(raw)
        }
        other => Err(Error::Corruption(format!(
            "unknown block compression kind: {other:#x}"
        ))),
    }
}
