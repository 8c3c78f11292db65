use std::sync::Arc;

use crate::env::{ReadableRegion, StorageEnv, WritableRegion};
use crate::error::{Error, Result};
use crate::remote::{Connection, Request, Response};

/// Buffer appends locally up to this size before shipping them, so tiny
/// builder writes do not each become their own round trip.
const WRITE_CHUNK: usize = 256 * 1024;

/// Storage environment backed by a memory node.
///
/// Regions map one-to-one onto keeper regions. Writes stream over the
/// control channel; once finalized, reads go through the capability
/// token, so an open region keeps working even if engine metadata about
/// the file has long moved on.
pub struct RemoteEnv {
    conn: Arc<Connection>,
}

impl RemoteEnv {
    pub fn new(conn: Arc<Connection>) -> Self {
        RemoteEnv { conn }
    }
}

impl StorageEnv for RemoteEnv {
    fn create_region(&self, name: &str) -> Result<Box<dyn WritableRegion>> {
        match self.conn.call(Request::Alloc { name: name.into() })? {
            Response::Ok => Ok(Box::new(RemoteWritable {
                conn: Arc::clone(&self.conn),
                name: name.to_string(),
                pending: Vec::new(),
                offset: 0,
            })),
            other => Err(unexpected(&other)),
        }
    }

    fn open_region(&self, name: &str) -> Result<Arc<dyn ReadableRegion>> {
        match self.conn.call(Request::Token { name: name.into() })? {
            Response::Token { token, len } => Ok(Arc::new(RemoteReadable {
                conn: Arc::clone(&self.conn),
                token,
                len,
            })),
            other => Err(unexpected(&other)),
        }
    }

    fn delete_region(&self, name: &str) -> Result<()> {
        match self.conn.call(Request::Delete { name: name.into() })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn list_regions(&self) -> Result<Vec<String>> {
        match self.conn.call(Request::List)? {
            Response::Names(names) => Ok(names),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Corruption(format!("unexpected memory node response: {response:?}"))
}

struct RemoteWritable {
    conn: Arc<Connection>,
    name: String,
    pending: Vec<u8>,
    offset: u64,
}

impl RemoteWritable {
    fn ship(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.pending);
        match self.conn.call(Request::Write {
            name: self.name.clone(),
            bytes,
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

impl WritableRegion for RemoteWritable {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);
        self.offset += data.len() as u64;
        if self.pending.len() >= WRITE_CHUNK {
            self.ship()?;
        }
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn finalize(&mut self) -> Result<()> {
        self.ship()?;
        match self.conn.call(Request::Finalize {
            name: self.name.clone(),
        })? {
            Response::Token { len, .. } => {
                if len != self.offset {
                    return Err(Error::Corruption(format!(
                        "memory node sealed {} at {len} bytes, wrote {}",
                        self.name, self.offset
                    )));
                }
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }
}

struct RemoteReadable {
    conn: Arc<Connection>,
    token: u64,
    len: u64,
}

impl ReadableRegion for RemoteReadable {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.len {
            return Err(Error::Corruption(format!(
                "read past region end: {offset}+{len} > {}",
                self.len
            )));
        }
        match self.conn.call(Request::ReadAt {
            token: self.token,
            offset,
            len: len as u32,
        })? {
            Response::Bytes(bytes) if bytes.len() == len => Ok(bytes),
            Response::Bytes(bytes) => Err(Error::Corruption(format!(
                "memory node returned {} bytes, wanted {len}",
                bytes.len()
            ))),
            other => Err(unexpected(&other)),
        }
    }
}
