//! Remote memory transport.
//!
//! A compute node talks to a memory node over a framed TCP protocol that
//! mirrors a one-sided remote-memory setup: control operations (allocate,
//! append, finalize, delete) are two-sided request/response exchanges,
//! while reads go through a capability token that the memory node issues
//! only when a region is finalized. A reader holding a token can fetch
//! arbitrary byte ranges without the memory node consulting any engine
//! state, and the token-at-finalize rule makes torn reads of half-written
//! regions impossible by construction.
//!
//! Wire frame, little-endian throughout:
//!
//! ```text
//! [crc32(4B)][len(4B)][body(len bytes)]     body = [opcode(1B)][fields]
//! ```
//!
//! The checksum covers the body. Integers are fixed-width LE; byte
//! strings are length-prefixed with a u32.

mod env;
mod keeper;
mod transport;

pub use env::RemoteEnv;
pub use keeper::{KeeperConfig, KeeperHandle, MemoryNodeKeeper};
pub use transport::{Connection, ConnectionConfig};

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Refuse frames larger than this; a bigger length field means a corrupt
/// or hostile peer, not a real message.
pub const MAX_FRAME_SIZE: usize = 64 << 20;

/// Operations the compute node sends to the memory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// First message on every connection; identifies the compute node.
    Handshake { node_id: u64 },
    /// Allocate an empty, unfinalized region.
    Alloc { name: String },
    /// Append bytes to an unfinalized region.
    Write { name: String, bytes: Vec<u8> },
    /// Seal a region and mint its read capability.
    Finalize { name: String },
    /// One-sided read through a capability token.
    ReadAt { token: u64, offset: u64, len: u32 },
    /// Drop a region and revoke its token. Idempotent.
    Delete { name: String },
    /// Look up the capability for an already-finalized region.
    Token { name: String },
    /// Names of all regions the memory node holds.
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Handshake { node_id: u64 },
    /// Capability plus the sealed region's total length.
    Token { token: u64, len: u64 },
    Bytes(Vec<u8>),
    Names(Vec<String>),
    Err { code: ErrCode, message: String },
}

/// Error classes the memory node can return. The client maps these back
/// onto [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrCode {
    NotFound = 1,
    InvalidArgument = 2,
    Capacity = 3,
}

impl ErrCode {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(ErrCode::NotFound),
            2 => Ok(ErrCode::InvalidArgument),
            3 => Ok(ErrCode::Capacity),
            other => Err(Error::Corruption(format!("unknown error code: {other}"))),
        }
    }
}

const OP_HANDSHAKE: u8 = 0x01;
const OP_ALLOC: u8 = 0x02;
const OP_WRITE: u8 = 0x03;
const OP_FINALIZE: u8 = 0x04;
const OP_READ_AT: u8 = 0x05;
const OP_DELETE: u8 = 0x06;
const OP_TOKEN: u8 = 0x07;
const OP_LIST: u8 = 0x08;

const OP_OK: u8 = 0x81;
const OP_R_HANDSHAKE: u8 = 0x82;
const OP_R_TOKEN: u8 = 0x83;
const OP_R_BYTES: u8 = 0x84;
const OP_R_NAMES: u8 = 0x85;
const OP_R_ERR: u8 = 0xFF;

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BodyReader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(Error::Corruption("message body truncated".into()));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn str(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Corruption("region name is not utf-8".into()))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(Error::Corruption("trailing bytes in message body".into()));
        }
        Ok(())
    }
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Handshake { node_id } => {
                buf.push(OP_HANDSHAKE);
                buf.extend_from_slice(&node_id.to_le_bytes());
            }
            Request::Alloc { name } => {
                buf.push(OP_ALLOC);
                put_str(&mut buf, name);
            }
            Request::Write { name, bytes } => {
                buf.push(OP_WRITE);
                put_str(&mut buf, name);
                put_bytes(&mut buf, bytes);
            }
            Request::Finalize { name } => {
                buf.push(OP_FINALIZE);
                put_str(&mut buf, name);
            }
            Request::ReadAt { token, offset, len } => {
                buf.push(OP_READ_AT);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
            }
            Request::Delete { name } => {
                buf.push(OP_DELETE);
                put_str(&mut buf, name);
            }
            Request::Token { name } => {
                buf.push(OP_TOKEN);
                put_str(&mut buf, name);
            }
            Request::List => buf.push(OP_LIST),
        }
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = BodyReader::new(body);
        let request = match r.u8()? {
            OP_HANDSHAKE => Request::Handshake { node_id: r.u64()? },
            OP_ALLOC => Request::Alloc { name: r.str()? },
            OP_WRITE => Request::Write {
                name: r.str()?,
                bytes: r.bytes()?.to_vec(),
            },
            OP_FINALIZE => Request::Finalize { name: r.str()? },
            OP_READ_AT => Request::ReadAt {
                token: r.u64()?,
                offset: r.u64()?,
                len: r.u32()?,
            },
            OP_DELETE => Request::Delete { name: r.str()? },
            OP_TOKEN => Request::Token { name: r.str()? },
            OP_LIST => Request::List,
            other => {
                return Err(Error::Corruption(format!("unknown request opcode: {other:#x}")));
            }
        };
        r.finish()?;
        Ok(request)
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Ok => buf.push(OP_OK),
            Response::Handshake { node_id } => {
                buf.push(OP_R_HANDSHAKE);
                buf.extend_from_slice(&node_id.to_le_bytes());
            }
            Response::Token { token, len } => {
                buf.push(OP_R_TOKEN);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
            }
            Response::Bytes(bytes) => {
                buf.push(OP_R_BYTES);
                put_bytes(&mut buf, bytes);
            }
            Response::Names(names) => {
                buf.push(OP_R_NAMES);
                buf.extend_from_slice(&(names.len() as u32).to_le_bytes());
                for name in names {
                    put_str(&mut buf, name);
                }
            }
            Response::Err { code, message } => {
                buf.push(OP_R_ERR);
                buf.push(*code as u8);
                put_str(&mut buf, message);
            }
        }
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = BodyReader::new(body);
        let response = match r.u8()? {
            OP_OK => Response::Ok,
            OP_R_HANDSHAKE => Response::Handshake { node_id: r.u64()? },
            OP_R_TOKEN => Response::Token {
                token: r.u64()?,
                len: r.u64()?,
            },
            OP_R_BYTES => Response::Bytes(r.bytes()?.to_vec()),
            OP_R_NAMES => {
                let count = r.u32()? as usize;
                let mut names = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    names.push(r.str()?);
                }
                Response::Names(names)
            }
            OP_R_ERR => Response::Err {
                code: ErrCode::from_u8(r.u8()?)?,
                message: r.str()?,
            },
            other => {
                return Err(Error::Corruption(format!(
                    "unknown response opcode: {other:#x}"
                )));
            }
        };
        r.finish()?;
        Ok(response)
    }

    /// Convert an error response into the engine error it stands for.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Err { code, message } => Err(match code {
                ErrCode::NotFound => Error::NotFound,
                ErrCode::InvalidArgument => Error::InvalidArgument(message),
                ErrCode::Capacity => Error::RemoteUnavailable(message),
            }),
            other => Ok(other),
        }
    }
}

/// Write one frame, checksummed, and flush.
pub fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> Result<()> {
    let crc = crc32fast::hash(body);
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(body)?;
    w.flush()?;
    Ok(())
}

/// Read one frame, verifying the checksum.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 8];
    r.read_exact(&mut header)?;
    let expected_crc = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Corruption(format!("frame length {len} exceeds limit")));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    if crc32fast::hash(&body) != expected_crc {
        return Err(Error::Corruption("frame checksum mismatch".into()));
    }
    Ok(body)
}
