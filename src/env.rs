//! Storage environment abstraction.
//!
//! Sorted files are written and read through region traits so the engine
//! never cares whether the bytes live in a local file or in registered
//! memory on a remote node. [`LocalEnv`] maps regions onto files in a
//! directory; the remote implementation lives in [`crate::remote`].

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A byte span being written. Append-only; readers must not observe the
/// region until [`finalize`](WritableRegion::finalize) returns.
pub trait WritableRegion: Send {
    /// Append bytes at the current tail.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes appended so far.
    fn offset(&self) -> u64;

    /// Make every appended byte durable/visible, then seal the region.
    fn finalize(&mut self) -> Result<()>;
}

/// A finalized, immutable byte span addressable at random offsets.
pub trait ReadableRegion: Send + Sync {
    /// Total length of the region.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// Allocation and lifecycle of named regions (one per sorted file).
pub trait StorageEnv: Send + Sync {
    /// Allocate a fresh region under `name`. Fails if it already exists.
    fn create_region(&self, name: &str) -> Result<Box<dyn WritableRegion>>;

    /// Open a finalized region for reading.
    fn open_region(&self, name: &str) -> Result<Arc<dyn ReadableRegion>>;

    /// Delete a region. Missing regions are not an error — deletion retries
    /// after a crashed sweep must be idempotent.
    fn delete_region(&self, name: &str) -> Result<()>;

    /// Names of all live regions, for repair and destroy.
    fn list_regions(&self) -> Result<Vec<String>>;
}

/// Local filesystem environment: one file per region under a root directory.
pub struct LocalEnv {
    root: PathBuf,
}

impl LocalEnv {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalEnv { root })
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::InvalidArgument(format!("bad region name: {name:?}")));
        }
        Ok(self.root.join(name))
    }
}

impl StorageEnv for LocalEnv {
    fn create_region(&self, name: &str) -> Result<Box<dyn WritableRegion>> {
        let path = self.path_of(name)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Box::new(LocalWritable {
            writer: BufWriter::new(file),
            offset: 0,
        }))
    }

    fn open_region(&self, name: &str) -> Result<Arc<dyn ReadableRegion>> {
        let path = self.path_of(name)?;
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Arc::new(LocalReadable { file, len }))
    }

    fn delete_region(&self, name: &str) -> Result<()> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_regions(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

struct LocalWritable {
    writer: BufWriter<File>,
    offset: u64,
}

impl WritableRegion for LocalWritable {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn finalize(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

struct LocalReadable {
    file: File,
    len: u64,
}

impl ReadableRegion for LocalReadable {
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
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}
