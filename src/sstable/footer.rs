use crate::error::{Error, Result};

/// Magic number identifying sorted-file regions.
pub const TABLE_MAGIC: u64 = 0x4C53_4D5F_5245_4D31; // "LSM_REM1"

/// An entry in the sorted file's index block.
/// Maps a block's last internal key to its location in the region.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Last (largest) internal key in the block.
    pub last_key: Vec<u8>,
    /// Byte offset of the block in the region.
    pub offset: u64,
    /// Stored size of the block in bytes (after compression, incl. trailer).
    pub size: u64,
}

impl IndexEntry {
    /// Format: [key_len(4B)][key][offset(8B)][size(8B)]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.last_key.len() + 16);
        buf.extend_from_slice(&(self.last_key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.last_key);
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decode one entry, returning (entry, bytes consumed).
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(Error::Corruption("index entry too short".into()));
        }
        let key_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let total = 4 + key_len + 16;
        if data.len() < total {
            return Err(Error::Corruption("index entry truncated".into()));
        }
        let last_key = data[4..4 + key_len].to_vec();
        let offset = u64::from_le_bytes(data[4 + key_len..12 + key_len].try_into().unwrap());
        let size = u64::from_le_bytes(data[12 + key_len..20 + key_len].try_into().unwrap());
        Ok((
            IndexEntry {
                last_key,
                offset,
                size,
            },
            total,
        ))
    }
}

/// The footer sits at the end of every sorted-file region.
/// It tells the reader where to find the index and filter blocks.
///
/// ```text
/// ┌──────────────────────────────────────┐
/// │ Index block offset (8B)              │
/// │ Index block size (8B)                │
/// │ Filter block offset (8B)             │
/// │ Filter block size (8B, 0 = none)     │
/// │ Entry count (8B)                     │
/// │ Magic number (8B)                    │
/// │ CRC of the above (4B) + padding (4B) │
/// └──────────────────────────────────────┘
/// ```
#[derive(Debug, Clone)]
pub struct Footer {
    pub index_offset: u64,
    pub index_size: u64,
    pub filter_offset: u64,
    pub filter_size: u64,
    pub entry_count: u64,
    pub magic: u64,
}

impl Footer {
    /// Size of the footer in bytes (fixed).
    pub const SIZE: usize = 8 * 6 + 8; // 56 bytes

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.index_offset.to_le_bytes());
        buf.extend_from_slice(&self.index_size.to_le_bytes());
        buf.extend_from_slice(&self.filter_offset.to_le_bytes());
        buf.extend_from_slice(&self.filter_size.to_le_bytes());
        buf.extend_from_slice(&self.entry_count.to_le_bytes());
        buf.extend_from_slice(&self.magic.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Corruption("footer too short".into()));
        }
        let stored_crc = u32::from_le_bytes(data[48..52].try_into().unwrap());
        let computed_crc = crc32fast::hash(&data[0..48]);
        if stored_crc != computed_crc {
            return Err(Error::Corruption("footer CRC mismatch".into()));
        }

        let magic = u64::from_le_bytes(data[40..48].try_into().unwrap());
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad magic: expected {TABLE_MAGIC:#x}, got {magic:#x}"
            )));
        }

        Ok(Footer {
            index_offset: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            index_size: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            filter_offset: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            filter_size: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            entry_count: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            magic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            index_offset: 4096,
            index_size: 512,
            filter_offset: 4608,
            filter_size: 128,
            entry_count: 1000,
            magic: TABLE_MAGIC,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), Footer::SIZE);
        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded.index_offset, 4096);
        assert_eq!(decoded.filter_size, 128);
        assert_eq!(decoded.entry_count, 1000);
    }

    #[test]
    fn footer_bad_magic() {
        let mut encoded = Footer {
            index_offset: 0,
            index_size: 0,
            filter_offset: 0,
            filter_size: 0,
            entry_count: 0,
            magic: TABLE_MAGIC,
        }
        .encode();
        encoded[40] = 0xFF;
        assert!(Footer::decode(&encoded).is_err());
    }

    #[test]
    fn footer_crc_detects_flip() {
        let mut encoded = Footer {
            index_offset: 77,
            index_size: 1,
            filter_offset: 0,
            filter_size: 0,
            entry_count: 5,
            magic: TABLE_MAGIC,
        }
        .encode();
        encoded[3] ^= 0x01;
        assert!(Footer::decode(&encoded).is_err());
    }

    #[test]
    fn footer_too_short() {
        assert!(Footer::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn index_entry_roundtrip() {
        let entry = IndexEntry {
            last_key: b"cherry".to_vec(),
            offset: 8192,
            size: 4096,
        };
        let encoded = entry.encode();
        let (decoded, consumed) = IndexEntry::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.last_key, b"cherry");
        assert_eq!(decoded.offset, 8192);
        assert_eq!(decoded.size, 4096);
    }
}
