//! Write-ahead log.
//!
//! One log file exists per active memtable; the file is named after the
//! memtable's generation and deleted once that memtable has been flushed
//! to a table. Each record carries one committed write batch:
//!
//! ```text
//! [crc32(4B)][len(4B)][payload(len bytes)]
//! ```
//!
//! The checksum covers the payload only. Recovery replays records in
//! order and stops at the first record that fails its checksum or is
//! truncated, treating everything from that point on as a torn tail
//! from a crash mid-append.

mod reader;
mod writer;

pub use reader::WalReader;
pub use writer::WalWriter;

/// Fixed bytes preceding every record payload.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Upper bound on a single record's payload. The writer refuses larger
/// appends, so a replay header claiming more than this can only be a
/// torn or corrupt tail and never costs the allocation it names.
pub const MAX_RECORD_SIZE: usize = 64 << 20;
