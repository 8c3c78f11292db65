//! An LSM-tree key-value storage engine with disaggregated compute and
//! memory roles.
//!
//! The compute node owns the write path (log, memtables, compaction
//! decisions); sorted files live in storage regions that can be local
//! files or registered memory on a remote [`remote::MemoryNodeKeeper`],
//! reached over a framed transport with capability-token reads. The
//! engine itself is a classic leveled LSM tree: writes land in a
//! skip-list memtable behind a write-ahead log, flush to sorted level-0
//! tables, and migrate down the levels through background compaction.
//!
//! ```no_run
//! use lsm_remote::{DB, Options, ReadOptions, WriteOptions};
//!
//! let db = DB::open(Options::default(), "/tmp/example-db")?;
//! db.put(&WriteOptions::default(), b"key", b"value")?;
//! assert_eq!(db.get(&ReadOptions::new(), b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), lsm_remote::Error>(())
//! ```

pub mod bloom;
pub mod cache;
pub mod compaction;
pub mod comparator;
pub mod db;
pub mod env;
pub mod error;
pub mod filter;
pub mod iterator;
pub mod memtable;
pub mod remote;
pub mod scheduler;
pub mod sstable;
pub mod types;
pub mod version;
pub mod wal;

pub use comparator::{BytewiseComparator, Comparator};
pub use db::batch::WriteBatch;
pub use db::iterator::DBIterator;
pub use db::{
    DB, Options, ReadOptions, RepairReport, Snapshot, WriteOptions, destroy_db, repair_db,
};
pub use env::{LocalEnv, ReadableRegion, StorageEnv, WritableRegion};
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use remote::{Connection, ConnectionConfig, KeeperConfig, MemoryNodeKeeper, RemoteEnv};
pub use sstable::CompressionKind;
