//! Core key/value types and the internal key codec.

use crate::error::{Error, Result};

/// Raw key bytes.
pub type Key = Vec<u8>;

/// Raw value bytes.
pub type Value = Vec<u8>;

/// Sequence numbers occupy 56 bits; the low byte of the tag is the value type.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Width of the tag suffix appended to every user key.
pub const TAG_SIZE: usize = 8;

/// Distinguishes puts from deletes in the storage engine.
/// A Delete writes a tombstone — the key isn't removed, it's marked as deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// A normal put operation.
    Put = 0x01,
    /// A delete (tombstone marker).
    Delete = 0x02,
}

impl ValueType {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(ValueType::Put),
            0x02 => Ok(ValueType::Delete),
            _ => Err(Error::Corruption(format!("invalid value type: {byte:#x}"))),
        }
    }
}

/// Type byte used when building a lookup key. It is larger than any real
/// value type, so for a fixed sequence the lookup key sorts ahead of every
/// entry written at that sequence.
const TYPE_FOR_SEEK: u8 = 0xFF;

/// Pack sequence number and value type into the 8-byte tag.
pub fn pack_tag(sequence: u64, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | value_type as u64
}

/// Split a tag back into (sequence, value type).
pub fn unpack_tag(tag: u64) -> Result<(u64, ValueType)> {
    let value_type = ValueType::from_u8((tag & 0xFF) as u8)?;
    Ok((tag >> 8, value_type))
}

/// Internal key format: user key + sequence number + value type.
///
/// Ordering: (user_key ASC, sequence DESC).
/// This ensures the newest version of a key always comes first during merging.
///
/// The sequence number is a monotonically increasing counter assigned to each
/// write operation at commit time. It provides a total ordering of all writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Key,
    pub sequence: u64,
    pub value_type: ValueType,
}

impl InternalKey {
    pub fn new(user_key: &[u8], sequence: u64, value_type: ValueType) -> Self {
        InternalKey {
            user_key: user_key.to_vec(),
            sequence,
            value_type,
        }
    }

    /// Encode to the wire form: `[user_key][tag (8B LE)]`.
    pub fn encode(&self) -> Vec<u8> {
        encode_internal_key(&self.user_key, self.sequence, self.value_type)
    }

    /// Decode from the wire form. Errors if too short or the type byte is bad.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < TAG_SIZE {
            return Err(Error::Corruption("internal key too short".into()));
        }
        let split = data.len() - TAG_SIZE;
        let tag = u64::from_le_bytes(data[split..].try_into().unwrap());
        let (sequence, value_type) = unpack_tag(tag)?;
        Ok(InternalKey {
            user_key: data[..split].to_vec(),
            sequence,
            value_type,
        })
    }
}

/// Encode `[user_key][tag]` without building an `InternalKey`.
pub fn encode_internal_key(user_key: &[u8], sequence: u64, value_type: ValueType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + TAG_SIZE);
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&pack_tag(sequence, value_type).to_le_bytes());
    buf
}

/// Build the key used to seek for "newest entry with sequence <= `sequence`".
pub fn lookup_key(user_key: &[u8], sequence: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + TAG_SIZE);
    buf.extend_from_slice(user_key);
    let tag = (sequence << 8) | TYPE_FOR_SEEK as u64;
    buf.extend_from_slice(&tag.to_le_bytes());
    buf
}

/// The user-key portion of an encoded internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= TAG_SIZE);
    &internal_key[..internal_key.len() - TAG_SIZE]
}

/// The tag portion of an encoded internal key.
pub fn extract_tag(internal_key: &[u8]) -> u64 {
    debug_assert!(internal_key.len() >= TAG_SIZE);
    let split = internal_key.len() - TAG_SIZE;
    u64::from_le_bytes(internal_key[split..].try_into().unwrap())
}

/// The sequence number of an encoded internal key.
pub fn extract_sequence(internal_key: &[u8]) -> u64 {
    extract_tag(internal_key) >> 8
}
