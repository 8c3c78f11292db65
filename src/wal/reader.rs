use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::Result;
use crate::wal::{MAX_RECORD_SIZE, RECORD_HEADER_SIZE};

/// Sequential reader over a log file.
///
/// `next_record` yields payloads in append order. A record whose header
/// or body is truncated, or whose checksum does not match, ends the
/// stream silently: that is the expected shape of a crash tail, not a
/// reportable corruption.
pub struct WalReader {
    file: BufReader<File>,
    done: bool,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(WalReader {
            file: BufReader::new(File::open(path)?),
            done: false,
        })
    }

    /// `Ok(None)` means end of replayable records.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let mut header = [0u8; RECORD_HEADER_SIZE];
        match read_full(&mut self.file, &mut header) {
            FillOutcome::Full => {}
            FillOutcome::Short => {
                self.done = true;
                return Ok(None);
            }
        }
        let expected_crc = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if len > MAX_RECORD_SIZE {
            self.done = true;
            return Ok(None);
        }

        let mut payload = vec![0u8; len];
        match read_full(&mut self.file, &mut payload) {
            FillOutcome::Full => {}
            FillOutcome::Short => {
                self.done = true;
                return Ok(None);
            }
        }
        if crc32fast::hash(&payload) != expected_crc {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

enum FillOutcome {
    Full,
    Short,
}

/// Read exactly `buf.len()` bytes, reporting a clean-or-torn short read
/// instead of an error.
fn read_full(file: &mut BufReader<File>, buf: &mut [u8]) -> FillOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return FillOutcome::Short,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return FillOutcome::Short,
        }
    }
    FillOutcome::Full
}
