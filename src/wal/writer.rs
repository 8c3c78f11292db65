use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::wal::MAX_RECORD_SIZE;

/// Appends framed records to a log file.
///
/// Buffered; every append flushes the user-space buffer so a process
/// crash loses at most what the OS had not written. When `sync` is
/// requested the file is additionally fsync'd before returning, making
/// the record durable against power loss.
pub struct WalWriter {
    file: BufWriter<File>,
}

impl WalWriter {
    /// Create a fresh log, truncating any existing file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(WalWriter {
            file: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, payload: &[u8], sync: bool) -> Result<()> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(Error::InvalidArgument(format!(
                "log record of {} bytes exceeds the {MAX_RECORD_SIZE} byte limit",
                payload.len()
            )));
        }
        let crc = crc32fast::hash(payload);
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.flush()?;
        if sync {
            self.file.get_ref().sync_all()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}
