//! The database: write path, read path, and background maintenance.
//!
//! One write mutex orders all commits: a batch is stamped with its
//! sequence range, appended to the write-ahead log, then applied to the
//! active memtable. Reads consult the active memtable, the immutable
//! memtable being flushed, and finally the sorted files of a pinned
//! version. Flushes and compactions run on dedicated worker pools and
//! publish their results through the version set.

pub mod batch;
pub mod filename;
pub mod iterator;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cache::{BlockCache, TableCache};
use crate::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
use crate::compaction::{self, Compaction, CompactionEnv};
use crate::env::{LocalEnv, StorageEnv};
use crate::error::{Error, Result};
use crate::filter::{BloomFilterPolicy, FilterPolicy};
use crate::iterator::StorageIterator;
use crate::iterator::merge::MergeIterator;
use crate::memtable::{LookupResult, MemTable};
use crate::scheduler::{JobOutcome, ThreadPool};
use crate::sstable::builder::TableBuilder;
use crate::sstable::reader::Table;
use crate::sstable::{CompressionKind, TableConfig};
use crate::types::{MAX_SEQUENCE, ValueType, extract_tag, extract_user_key, lookup_key, unpack_tag};
use crate::version::edit::VersionEdit;
use crate::version::{FileMeta, NUM_LEVELS, Version, VersionSet};
use crate::wal::{WalReader, WalWriter};
use batch::WriteBatch;
use filename::{FileKind, MANIFEST_NAME, parse_name, table_name, wal_name};
use iterator::DBIterator;

/// Engine configuration. The defaults are sized for a compute node with
/// a few hundred MiB to spare; the interesting knobs for a remote setup
/// are `env` (where sorted files live) and `block_cache_bytes` (how much
/// remote data to keep resident locally).
#[derive(Clone)]
pub struct Options {
    pub comparator: Arc<dyn Comparator>,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    /// Sorted-file storage; `None` means local files under the db path.
    pub env: Option<Arc<dyn StorageEnv>>,
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    /// Verify table blocks on every internal read, not just when asked.
    pub paranoid_checks: bool,
    pub write_buffer_size: usize,
    pub block_cache_bytes: usize,
    pub max_open_files: usize,
    pub block_size: usize,
    pub block_restart_interval: usize,
    pub max_file_size: u64,
    pub compression: CompressionKind,
    pub flush_threads: usize,
    pub compaction_threads: usize,
    /// L0 file count that makes level 0 eligible for compaction.
    pub l0_compaction_trigger: usize,
    /// L0 file count at which each write sleeps briefly.
    pub l0_slowdown_writes_trigger: usize,
    /// L0 file count at which writes block until compaction catches up.
    pub l0_stop_writes_trigger: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            comparator: Arc::new(BytewiseComparator),
            filter_policy: Some(Arc::new(BloomFilterPolicy::new(10))),
            env: None,
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            block_cache_bytes: 8 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4096,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionKind::None,
            flush_threads: 1,
            compaction_threads: 1,
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub verify_checksums: bool,
    pub fill_cache: bool,
    pub snapshot: Option<Snapshot>,
}

impl ReadOptions {
    pub fn new() -> Self {
        ReadOptions {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Fsync the log before acknowledging the write.
    pub sync: bool,
}

/// A frozen point in time. Plain data: releasing it is advisory (it
/// unpins nothing by itself) but tells compaction it may reclaim
/// entries the snapshot was holding visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    sequence: u64,
}

impl Snapshot {
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    pub flush_count: AtomicU64,
    pub flush_bytes: AtomicU64,
    pub compaction_count: AtomicU64,
    pub compaction_bytes_read: AtomicU64,
    pub compaction_bytes_written: AtomicU64,
    pub compaction_entries_dropped: AtomicU64,
}

struct Mems {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    /// WAL file number feeding `mem`. Logs below this are obsolete once
    /// `imm` is flushed.
    log_number: u64,
    wal: WalWriter,
}

pub(crate) struct DbInner {
    opts: Options,
    path: PathBuf,
    pub(crate) env: Arc<dyn StorageEnv>,
    pub(crate) icmp: Arc<InternalKeyComparator>,
    table_cfg: TableConfig,
    pub(crate) versions: VersionSet,
    pub(crate) block_cache: Arc<BlockCache>,
    table_cache: TableCache,
    mems: Mutex<Mems>,
    work_cv: Condvar,
    snapshots: Mutex<Vec<u64>>,
    flush_pool: Mutex<Option<ThreadPool>>,
    compaction_pool: Mutex<Option<ThreadPool>>,
    /// Levels claimed by an in-flight compaction. A job on level L claims
    /// L and L+1, so distinct level pairs compact concurrently while the
    /// same pair never compacts twice at once.
    compacting: Mutex<HashSet<usize>>,
    shutting_down: AtomicBool,
    background_error: Mutex<Option<String>>,
    pub(crate) stats: EngineStats,
}

/// Handle to an open database. Cheap to clone-by-reference through its
/// iterators; dropping the handle shuts down background work.
pub struct DB {
    inner: Arc<DbInner>,
}

impl DB {
    pub fn open(opts: Options, path: impl AsRef<Path>) -> Result<DB> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let manifest_path = path.join(MANIFEST_NAME);
        let existing = manifest_path.exists();
        if existing && opts.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "database already exists at {}",
                path.display()
            )));
        }
        if !existing && !opts.create_if_missing {
            return Err(Error::InvalidArgument(format!(
                "no database at {} and create_if_missing is off",
                path.display()
            )));
        }

        let icmp = Arc::new(InternalKeyComparator::new(opts.comparator.clone()));
        let versions = if existing {
            VersionSet::recover(Arc::clone(&icmp), manifest_path)?
        } else {
            VersionSet::new(Arc::clone(&icmp), manifest_path)
        };
        let env: Arc<dyn StorageEnv> = match &opts.env {
            Some(env) => Arc::clone(env),
            None => Arc::new(LocalEnv::new(path.join("tables"))?),
        };
        let table_cfg = TableConfig {
            block_size: opts.block_size,
            block_restart_interval: opts.block_restart_interval,
            compression: opts.compression,
            filter_policy: opts.filter_policy.clone(),
        };

        // Replay logs written since the manifest's log number.
        let mem = Arc::new(MemTable::new(Arc::clone(&icmp)));
        let mut max_sequence = versions.last_sequence();
        let mut old_logs = list_wal_numbers(&path)?;
        old_logs.retain(|n| *n >= versions.log_number());
        old_logs.sort_unstable();
        for number in &old_logs {
            let mut reader = WalReader::open(&path.join(wal_name(*number)))?;
            while let Some(payload) = reader.next_record()? {
                let batch = WriteBatch::from_payload(payload)?;
                let mut seq = batch.sequence();
                batch.iterate(|vt, key, value| {
                    mem.add(seq, vt, key, value);
                    seq += 1;
                })?;
                max_sequence = max_sequence.max(seq.saturating_sub(1));
            }
        }
        versions.set_last_sequence(max_sequence);

        // Rotate to a fresh log. Replayed data that is only in the
        // memtable is flushed first, so dropping the old logs is safe.
        let new_log = versions.new_file_number();
        let wal = WalWriter::create(&path.join(wal_name(new_log)))?;
        let mut edit = VersionEdit::new();
        edit.set_log_number(new_log);
        if !mem.is_empty() {
            let number = versions.new_file_number();
            let meta = build_table(env.as_ref(), &table_cfg, number, &mem)?;
            log::info!(
                "recovered {} entries from {} log(s) into table {number:06}",
                mem.len(),
                old_logs.len()
            );
            edit.add_file(0, meta);
        }
        versions.log_and_apply(&edit)?;
        for number in old_logs {
            if number != new_log {
                let _ = fs::remove_file(path.join(wal_name(number)));
            }
        }

        let inner = Arc::new(DbInner {
            table_cache: TableCache::new(opts.max_open_files),
            block_cache: Arc::new(BlockCache::new(opts.block_cache_bytes)),
            flush_pool: Mutex::new(Some(ThreadPool::new("flush", opts.flush_threads))),
            compaction_pool: Mutex::new(Some(ThreadPool::new(
                "compact",
                opts.compaction_threads,
            ))),
            mems: Mutex::new(Mems {
                mem: Arc::new(MemTable::new(Arc::clone(&icmp))),
                imm: None,
                log_number: new_log,
                wal,
            }),
            work_cv: Condvar::new(),
            snapshots: Mutex::new(Vec::new()),
            compacting: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
            background_error: Mutex::new(None),
            stats: EngineStats::default(),
            opts,
            path,
            env,
            icmp,
            table_cfg,
            versions,
        });
        inner.remove_orphan_regions()?;
        inner.maybe_schedule_compaction();
        Ok(DB { inner })
    }

    pub fn put(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(opts, batch)
    }

    pub fn delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(opts, batch)
    }

    /// Commit a batch atomically: one log record, contiguous sequence
    /// numbers, all-or-nothing visibility.
    pub fn write(&self, opts: &WriteOptions, mut batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.inner.maybe_slow_down();
        let mut mems = self.inner.mems.lock();
        self.inner.make_room_for_write(&mut mems)?;

        let sequence = self.inner.versions.allocate_sequences(batch.count() as u64);
        batch.set_sequence(sequence);
        mems.wal.append(batch.payload(), opts.sync)?;

        let mem = Arc::clone(&mems.mem);
        let mut seq = sequence;
        batch.iterate(|value_type, key, value| {
            mem.add(seq, value_type, key, value);
            seq += 1;
        })?;
        Ok(())
    }

    pub fn get(&self, opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let sequence = match &opts.snapshot {
            Some(s) => s.sequence(),
            None => self.inner.versions.last_sequence(),
        };
        let (mem, imm) = {
            let mems = self.inner.mems.lock();
            (Arc::clone(&mems.mem), mems.imm.clone())
        };
        match mem.get(key, sequence) {
            Some(LookupResult::Value(v)) => return Ok(Some(v)),
            Some(LookupResult::Deleted) => return Ok(None),
            None => {}
        }
        if let Some(imm) = imm {
            match imm.get(key, sequence) {
                Some(LookupResult::Value(v)) => return Ok(Some(v)),
                Some(LookupResult::Deleted) => return Ok(None),
                None => {}
            }
        }
        let handle = self.inner.versions.acquire_current()?;
        let result = self
            .inner
            .get_from_version(&handle.version, key, sequence, opts);
        self.inner.release_version(handle.generation);
        result
    }

    /// A consistent, bidirectional view over every live key.
    pub fn iter(&self, opts: &ReadOptions) -> Result<DBIterator> {
        let sequence = match &opts.snapshot {
            Some(s) => s.sequence(),
            None => self.inner.versions.last_sequence(),
        };
        let (mem, imm) = {
            let mems = self.inner.mems.lock();
            (Arc::clone(&mems.mem), mems.imm.clone())
        };
        let handle = self.inner.versions.acquire_current()?;

        let built = (|| -> Result<MergeIterator> {
            let mut children: Vec<Box<dyn StorageIterator>> = Vec::new();
            children.push(Box::new(mem.iter()));
            if let Some(imm) = &imm {
                children.push(Box::new(imm.iter()));
            }
            for files in &handle.version.files {
                for file in files {
                    let table = self.inner.open_table(file.number)?;
                    children.push(Box::new(crate::sstable::iterator::TableIterator::new(
                        table,
                        opts.verify_checksums,
                        opts.fill_cache,
                    )));
                }
            }
            let cmp = Arc::clone(&self.inner.icmp) as Arc<dyn Comparator>;
            Ok(MergeIterator::new(cmp, children))
        })();
        match built {
            Ok(merged) => Ok(DBIterator::new(
                Arc::clone(&self.inner),
                handle.generation,
                merged,
                sequence,
            )),
            Err(e) => {
                self.inner.release_version(handle.generation);
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let sequence = self.inner.versions.last_sequence();
        self.inner.snapshots.lock().push(sequence);
        Snapshot { sequence }
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        let mut snaps = self.inner.snapshots.lock();
        if let Some(i) = snaps.iter().position(|&s| s == snapshot.sequence) {
            snaps.swap_remove(i);
        }
    }

    /// Force the active memtable out to a level-0 table and wait for it.
    pub fn flush(&self) -> Result<()> {
        let mut mems = self.inner.mems.lock();
        if !mems.mem.is_empty() {
            while mems.imm.is_some() {
                self.inner.check_background_error()?;
                self.inner.work_cv.wait(&mut mems);
            }
            self.inner.seal_memtable(&mut mems)?;
        }
        while mems.imm.is_some() {
            self.inner.check_background_error()?;
            self.inner.work_cv.wait(&mut mems);
        }
        Ok(())
    }

    /// Synchronously merge every file overlapping `[begin, end]` down the
    /// tree. Converges: a second identical call finds nothing new to do
    /// at the levels the first call already drained.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.flush()?;
        for level in 0..NUM_LEVELS - 1 {
            self.inner.compact_level_range(level, begin, end)?;
        }
        Ok(())
    }

    /// Approximate on-storage byte size of each `[begin, end)` range.
    pub fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Result<Vec<u64>> {
        let handle = self.inner.versions.acquire_current()?;
        let result = (|| -> Result<Vec<u64>> {
            let mut sizes = Vec::with_capacity(ranges.len());
            for (begin, end) in ranges {
                let start_ikey = lookup_key(begin, MAX_SEQUENCE);
                let end_ikey = lookup_key(end, MAX_SEQUENCE);
                let mut total = 0u64;
                for files in &handle.version.files {
                    for file in files {
                        let table = self.inner.open_table(file.number)?;
                        let lo = table.approximate_offset_of(&start_ikey);
                        let hi = table.approximate_offset_of(&end_ikey);
                        total += hi.saturating_sub(lo);
                    }
                }
                sizes.push(total);
            }
            Ok(sizes)
        })();
        self.inner.release_version(handle.generation);
        result
    }

    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.inner.versions.current().num_files(level)
    }

    /// Introspection by property name, in the usual "prefix.key" style.
    pub fn get_property(&self, name: &str) -> Option<String> {
        let key = name.strip_prefix("lsm-remote.")?;
        if let Some(level) = key.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(self.num_files_at_level(level).to_string());
        }
        match key {
            "levels" => {
                let version = self.inner.versions.current();
                let mut out = String::from("level files bytes\n");
                for level in 0..NUM_LEVELS {
                    out.push_str(&format!(
                        "{:5} {:5} {:5}\n",
                        level,
                        version.num_files(level),
                        version.level_bytes(level)
                    ));
                }
                Some(out)
            }
            "sstables" => {
                let version = self.inner.versions.current();
                let mut out = String::new();
                for level in 0..NUM_LEVELS {
                    if version.files[level].is_empty() {
                        continue;
                    }
                    out.push_str(&format!("--- level {level} ---\n"));
                    for f in &version.files[level] {
                        out.push_str(&format!(
                            "{:06}: {} bytes [{} .. {}]\n",
                            f.number,
                            f.file_size,
                            String::from_utf8_lossy(extract_user_key(&f.smallest)),
                            String::from_utf8_lossy(extract_user_key(&f.largest))
                        ));
                    }
                }
                Some(out)
            }
            "stats" => {
                let s = &self.inner.stats;
                Some(format!(
                    "flushes: {} ({} bytes)\n\
                     compactions: {} ({} read, {} written, {} entries dropped)\n\
                     block cache: {} hits, {} misses\n\
                     live generations: {}\n",
                    s.flush_count.load(Ordering::Relaxed),
                    s.flush_bytes.load(Ordering::Relaxed),
                    s.compaction_count.load(Ordering::Relaxed),
                    s.compaction_bytes_read.load(Ordering::Relaxed),
                    s.compaction_bytes_written.load(Ordering::Relaxed),
                    s.compaction_entries_dropped.load(Ordering::Relaxed),
                    self.inner.block_cache.hit_count(),
                    self.inner.block_cache.miss_count(),
                    self.inner.versions.live_generations(),
                ))
            }
            _ => None,
        }
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        // Join flush first so a final flush can still queue (and be
        // refused by) the compaction pool, then join compaction.
        let flush = self.inner.flush_pool.lock().take();
        if let Some(mut pool) = flush {
            pool.shutdown();
        }
        let compact = self.inner.compaction_pool.lock().take();
        if let Some(mut pool) = compact {
            pool.shutdown();
        }
        if let Some(msg) = self.inner.background_error.lock().as_ref() {
            log::error!("closed with background error: {msg}");
        }
    }
}

impl DbInner {
    pub(crate) fn open_table(&self, number: u64) -> Result<Arc<Table>> {
        self.table_cache.get_or_open(number, || {
            let region = self.env.open_region(&table_name(number))?;
            Ok(Arc::new(Table::open(
                number,
                region,
                Arc::clone(&self.icmp),
                self.table_cfg.clone(),
                Some(Arc::clone(&self.block_cache)),
            )?))
        })
    }

    fn get_from_version(
        &self,
        version: &Version,
        user_key: &[u8],
        sequence: u64,
        opts: &ReadOptions,
    ) -> Result<Option<Vec<u8>>> {
        let ikey = lookup_key(user_key, sequence);
        let ucmp = self.icmp.user_comparator();
        let verify = opts.verify_checksums || self.opts.paranoid_checks;
        for (_level, file) in version.files_for_get(ucmp.as_ref(), user_key) {
            let table = self.open_table(file.number)?;
            if let Some((found_key, value)) = table.get(&ikey, verify, opts.fill_cache)? {
                if ucmp.compare(extract_user_key(&found_key), user_key).is_eq() {
                    let (_, value_type) = unpack_tag(extract_tag(&found_key))?;
                    return Ok(match value_type {
                        ValueType::Put => Some(value),
                        ValueType::Delete => None,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Release a pinned generation and physically drop anything that
    /// became unreferenced.
    pub(crate) fn release_version(&self, generation: u64) {
        let deletable = self.versions.release(generation);
        self.remove_files(&deletable);
    }

    fn remove_files(&self, numbers: &[u64]) {
        for &number in numbers {
            if let Err(e) = self.env.delete_region(&table_name(number)) {
                // Deletion retries on the next sweep that notices it.
                log::warn!("could not delete table {number:06}: {e}");
            }
            self.table_cache.evict(number);
            self.block_cache.erase_file(number);
            log::debug!("dropped table {number:06}");
        }
    }

    /// Regions left behind by a crashed flush or compaction: valid table
    /// names that no live version references.
    fn remove_orphan_regions(&self) -> Result<()> {
        let version = self.versions.current();
        let mut live = std::collections::HashSet::new();
        for files in &version.files {
            for f in files {
                live.insert(f.number);
            }
        }
        for name in self.env.list_regions()? {
            if let FileKind::Table(number) = parse_name(&name) {
                if !live.contains(&number) {
                    log::info!("removing orphan table {name}");
                    let _ = self.env.delete_region(&name);
                }
            }
        }
        Ok(())
    }

    fn check_background_error(&self) -> Result<()> {
        match self.background_error.lock().as_ref() {
            Some(msg) => Err(Error::Io(std::io::Error::other(msg.clone()))),
            None => Ok(()),
        }
    }

    fn set_background_error(&self, e: &Error) {
        let mut slot = self.background_error.lock();
        if slot.is_none() {
            *slot = Some(e.to_string());
        }
    }

    fn maybe_slow_down(&self) {
        let l0 = self.versions.current().num_files(0);
        if l0 >= self.opts.l0_slowdown_writes_trigger {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn make_room_for_write(self: &Arc<Self>, mems: &mut MutexGuard<'_, Mems>) -> Result<()> {
        loop {
            self.check_background_error()?;
            if self.versions.current().num_files(0) >= self.opts.l0_stop_writes_trigger {
                self.maybe_schedule_compaction();
                let _ = self
                    .work_cv
                    .wait_for(mems, Duration::from_millis(100));
                continue;
            }
            if mems.mem.approximate_size() < self.opts.write_buffer_size {
                return Ok(());
            }
            if mems.imm.is_some() {
                self.schedule_flush();
                self.work_cv.wait(mems);
                continue;
            }
            self.seal_memtable(mems)?;
        }
    }

    /// Swap in an empty memtable with a fresh log; the old one becomes
    /// the immutable memtable and a flush is queued.
    fn seal_memtable(self: &Arc<Self>, mems: &mut MutexGuard<'_, Mems>) -> Result<()> {
        let new_log = self.versions.new_file_number();
        let wal = WalWriter::create(&self.path.join(wal_name(new_log)))?;
        let old = std::mem::replace(
            &mut mems.mem,
            Arc::new(MemTable::new(Arc::clone(&self.icmp))),
        );
        mems.imm = Some(old);
        mems.log_number = new_log;
        mems.wal = wal;
        self.schedule_flush();
        Ok(())
    }

    fn schedule_flush(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let pool = self.flush_pool.lock();
        if let Some(pool) = pool.as_ref() {
            pool.submit(move || flush_job(&inner));
        }
    }

    pub(crate) fn maybe_schedule_compaction(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = self.versions.acquire_current() else {
            return;
        };
        let candidates =
            compaction::pick_levels(&handle.version, self.opts.l0_compaction_trigger);
        self.release_version(handle.generation);

        for (level, _) in candidates {
            if !self.try_claim_levels(level) {
                continue;
            }
            let inner = Arc::clone(self);
            let submitted = {
                let pool = self.compaction_pool.lock();
                match pool.as_ref() {
                    Some(pool) => pool.submit(move || compaction_job(&inner, level)),
                    None => false,
                }
            };
            if !submitted {
                self.unclaim_levels(level);
            }
        }
    }

    fn try_claim_levels(&self, level: usize) -> bool {
        let mut busy = self.compacting.lock();
        if busy.contains(&level) || busy.contains(&(level + 1)) {
            return false;
        }
        busy.insert(level);
        busy.insert(level + 1);
        true
    }

    fn unclaim_levels(&self, level: usize) {
        let mut busy = self.compacting.lock();
        busy.remove(&level);
        busy.remove(&(level + 1));
    }

    fn smallest_live_sequence(&self) -> u64 {
        let snaps = self.snapshots.lock();
        snaps
            .iter()
            .copied()
            .min()
            .unwrap_or_else(|| self.versions.last_sequence())
    }

    /// Build a level-0 table from the immutable memtable and install it.
    fn flush_imm(&self) -> Result<bool> {
        let imm = self.mems.lock().imm.clone();
        let Some(imm) = imm else {
            return Ok(false);
        };
        let number = self.versions.new_file_number();
        let meta = match build_table(self.env.as_ref(), &self.table_cfg, number, &imm) {
            Ok(meta) => meta,
            Err(e) => {
                let _ = self.env.delete_region(&table_name(number));
                return Err(e);
            }
        };
        let bytes = meta.file_size;
        let entries = meta.entry_count;

        let log_number = self.mems.lock().log_number;
        let mut edit = VersionEdit::new();
        edit.add_file(0, meta);
        edit.set_log_number(log_number);
        edit.last_sequence = Some(self.versions.last_sequence());
        let deletable = self.versions.log_and_apply(&edit)?;
        self.remove_files(&deletable);

        self.mems.lock().imm = None;
        self.work_cv.notify_all();
        self.delete_obsolete_wals();

        self.stats.flush_count.fetch_add(1, Ordering::Relaxed);
        self.stats.flush_bytes.fetch_add(bytes, Ordering::Relaxed);
        log::info!("flushed table {number:06}: {entries} entries, {bytes} bytes");
        Ok(true)
    }

    fn delete_obsolete_wals(&self) {
        let floor = self.versions.log_number();
        if let Ok(numbers) = list_wal_numbers(&self.path) {
            for number in numbers {
                if number < floor {
                    let _ = fs::remove_file(self.path.join(wal_name(number)));
                }
            }
        }
    }

    /// Run one compaction at `level` if it is still over budget.
    fn compact_once(&self, level: usize) -> Result<bool> {
        let handle = self.versions.acquire_current()?;
        let result = self.compact_version(&handle.version, level);
        self.release_version(handle.generation);
        result
    }

    fn compact_version(&self, version: &Version, level: usize) -> Result<bool> {
        let score = compaction::level_score(version, level, self.opts.l0_compaction_trigger);
        if score < 1.0 {
            return Ok(false);
        }
        let pointer = self.versions.compact_pointer(level);
        let Some(c) = compaction::pick_compaction(&self.icmp, version, level, &pointer) else {
            return Ok(false);
        };
        log::debug!(
            "compacting level {level} (score {score:.2}): {} + {} files",
            c.inputs[0].len(),
            c.inputs[1].len()
        );
        self.run_one_compaction(&c, version)?;
        Ok(true)
    }

    fn run_one_compaction(&self, c: &Compaction, version: &Version) -> Result<()> {
        if c.is_trivial_move() {
            let file = c.inputs[0][0].number;
            let deletable = self.versions.log_and_apply(&c.trivial_move_edit())?;
            self.remove_files(&deletable);
            self.stats.compaction_count.fetch_add(1, Ordering::Relaxed);
            log::info!("moved table {file:06} to level {}", c.output_level());
            return Ok(());
        }

        let new_numbers: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        let open_table = |n: u64| self.open_table(n);
        let new_file_number = || {
            let n = self.versions.new_file_number();
            new_numbers.lock().push(n);
            n
        };
        let region_name = table_name;
        let ctx = CompactionEnv {
            icmp: Arc::clone(&self.icmp),
            env: self.env.as_ref(),
            table_cfg: self.table_cfg.clone(),
            open_table: &open_table,
            new_file_number: &new_file_number,
            region_name: &region_name,
            smallest_live_sequence: self.smallest_live_sequence(),
            max_output_bytes: self.opts.max_file_size,
        };

        let result = (|| -> Result<compaction::CompactionStats> {
            let (edit, stats) = compaction::run_compaction(c, &ctx, version)?;
            let deletable = self.versions.log_and_apply(&edit)?;
            self.remove_files(&deletable);
            Ok(stats)
        })();
        match result {
            Ok(stats) => {
                self.stats.compaction_count.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .compaction_bytes_read
                    .fetch_add(stats.bytes_read, Ordering::Relaxed);
                self.stats
                    .compaction_bytes_written
                    .fetch_add(stats.bytes_written, Ordering::Relaxed);
                self.stats
                    .compaction_entries_dropped
                    .fetch_add(stats.entries_dropped, Ordering::Relaxed);
                log::info!(
                    "compacted level {}: {} inputs -> {} outputs, {} entries dropped",
                    c.level,
                    c.num_input_files(),
                    stats.output_files,
                    stats.entries_dropped
                );
                Ok(())
            }
            Err(e) => {
                for number in new_numbers.into_inner() {
                    let _ = self.env.delete_region(&table_name(number));
                }
                Err(e)
            }
        }
    }

    /// One synchronous range compaction at `level`, used by compact_range.
    fn compact_level_range(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        // Wait out any background job touching the same level pair.
        while !self.try_claim_levels(level) {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let result = self.compact_level_range_locked(level, begin, end);
        self.unclaim_levels(level);
        result
    }

    fn compact_level_range_locked(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let handle = self.versions.acquire_current()?;
        let result = (|| -> Result<()> {
            let ucmp = self.icmp.user_comparator();
            let inputs0 = handle
                .version
                .overlapping_files(ucmp.as_ref(), level, begin, end);
            if inputs0.is_empty() {
                return Ok(());
            }
            let c = Compaction {
                level,
                inputs: [inputs0.clone(), Vec::new()],
            };
            let (smallest, largest) = compaction::range_of(&inputs0);
            let inputs1 = handle.version.overlapping_files(
                ucmp.as_ref(),
                level + 1,
                Some(extract_user_key(&smallest)),
                Some(extract_user_key(&largest)),
            );
            let c = Compaction {
                inputs: [c.inputs[0].clone(), inputs1],
                level,
            };
            self.run_one_compaction(&c, &handle.version)
        })();
        self.release_version(handle.generation);
        result
    }
}

fn flush_job(inner: &Arc<DbInner>) -> JobOutcome {
    match inner.flush_imm() {
        Ok(true) => {
            inner.maybe_schedule_compaction();
            JobOutcome::Installed
        }
        Ok(false) => JobOutcome::Nothing,
        Err(e) if e.is_retryable() && !inner.shutting_down.load(Ordering::SeqCst) => {
            std::thread::sleep(Duration::from_millis(100));
            inner.schedule_flush();
            JobOutcome::Retry(e)
        }
        Err(e) => {
            inner.set_background_error(&e);
            inner.work_cv.notify_all();
            JobOutcome::Fatal(e)
        }
    }
}

fn compaction_job(inner: &Arc<DbInner>, level: usize) -> JobOutcome {
    let outcome = if inner.shutting_down.load(Ordering::SeqCst) {
        JobOutcome::Nothing
    } else if inner.check_background_error().is_err() {
        JobOutcome::Nothing
    } else {
        match inner.compact_once(level) {
            Ok(true) => JobOutcome::Installed,
            Ok(false) => JobOutcome::Nothing,
            Err(e) if e.is_retryable() => JobOutcome::Retry(e),
            Err(e) => {
                inner.set_background_error(&e);
                JobOutcome::Fatal(e)
            }
        }
    };
    inner.unclaim_levels(level);
    inner.work_cv.notify_all();
    match &outcome {
        JobOutcome::Installed => inner.maybe_schedule_compaction(),
        JobOutcome::Retry(_) => {
            std::thread::sleep(Duration::from_millis(100));
            inner.maybe_schedule_compaction();
        }
        _ => {}
    }
    outcome
}

/// Write one sorted table from a memtable's contents.
fn build_table(
    env: &dyn StorageEnv,
    cfg: &TableConfig,
    number: u64,
    mem: &Arc<MemTable>,
) -> Result<FileMeta> {
    let region = env.create_region(&table_name(number))?;
    let mut builder = TableBuilder::new(region, cfg.clone());
    let mut it = mem.iter();
    it.seek_to_first()?;
    while it.is_valid() {
        builder.add(it.key(), it.value())?;
        it.next()?;
    }
    let handle = builder.finish()?;
    Ok(FileMeta {
        number,
        file_size: handle.file_size,
        smallest: handle.smallest,
        largest: handle.largest,
        entry_count: handle.entry_count,
    })
}

fn list_wal_numbers(path: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let FileKind::Wal(n) = parse_name(name) {
                numbers.push(n);
            }
        }
    }
    Ok(numbers)
}

/// Remove every trace of a database: local files and, when a custom
/// environment is supplied, its regions too.
pub fn destroy_db(path: impl AsRef<Path>, env: Option<&dyn StorageEnv>) -> Result<()> {
    let path = path.as_ref();
    if let Some(env) = env {
        for name in env.list_regions()? {
            if parse_name(&name) != FileKind::Unknown {
                env.delete_region(&name)?;
            }
        }
    }
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Outcome of [`repair_db`].
#[derive(Debug, Default)]
pub struct RepairReport {
    pub tables_kept: usize,
    pub tables_dropped: usize,
    pub max_sequence: u64,
}

/// Rebuild a usable manifest from whatever intact tables remain.
///
/// Every readable table is re-registered at level 0 (overlap there is
/// legal, and normal compaction sorts the tree out afterwards).
/// Unreadable tables are dropped. Logs are kept; setting the recovered
/// log number to zero makes the next open replay all of them.
pub fn repair_db(opts: &Options, path: impl AsRef<Path>) -> Result<RepairReport> {
    let path = path.as_ref().to_path_buf();
    let icmp = Arc::new(InternalKeyComparator::new(opts.comparator.clone()));
    let env: Arc<dyn StorageEnv> = match &opts.env {
        Some(env) => Arc::clone(env),
        None => Arc::new(LocalEnv::new(path.join("tables"))?),
    };
    let table_cfg = TableConfig {
        block_size: opts.block_size,
        block_restart_interval: opts.block_restart_interval,
        compression: opts.compression,
        filter_policy: opts.filter_policy.clone(),
    };

    let mut report = RepairReport::default();
    let mut edit = VersionEdit::new();
    for name in env.list_regions()? {
        let FileKind::Table(number) = parse_name(&name) else {
            continue;
        };
        match scan_table(env.as_ref(), &table_cfg, &icmp, number) {
            Ok((meta, max_seq)) => {
                report.max_sequence = report.max_sequence.max(max_seq);
                report.tables_kept += 1;
                edit.add_file(0, meta);
            }
            Err(e) => {
                log::warn!("repair: dropping unreadable table {name}: {e}");
                report.tables_dropped += 1;
                let _ = env.delete_region(&name);
            }
        }
    }

    let versions = VersionSet::new(icmp, path.join(MANIFEST_NAME));
    edit.last_sequence = Some(report.max_sequence);
    versions.log_and_apply(&edit)?;
    log::info!(
        "repair: kept {} table(s), dropped {}, last sequence {}",
        report.tables_kept,
        report.tables_dropped,
        report.max_sequence
    );
    Ok(report)
}

/// Full scan of one table: validates every block and finds the largest
/// sequence number it holds.
fn scan_table(
    env: &dyn StorageEnv,
    cfg: &TableConfig,
    icmp: &Arc<InternalKeyComparator>,
    number: u64,
) -> Result<(FileMeta, u64)> {
    let region = env.open_region(&table_name(number))?;
    let file_size = region.len();
    let table = Arc::new(Table::open(
        number,
        region,
        Arc::clone(icmp),
        cfg.clone(),
        None,
    )?);
    let mut it = crate::sstable::iterator::TableIterator::new(Arc::clone(&table), true, false);
    it.seek_to_first()?;
    let mut smallest = None;
    let mut largest = None;
    let mut entry_count = 0u64;
    let mut max_seq = 0u64;
    while it.is_valid() {
        if smallest.is_none() {
            smallest = Some(it.key().to_vec());
        }
        largest = Some(it.key().to_vec());
        max_seq = max_seq.max(crate::types::extract_sequence(it.key()));
        entry_count += 1;
        it.next()?;
    }
    let (Some(smallest), Some(largest)) = (smallest, largest) else {
        return Err(Error::Corruption(format!("table {number:06} is empty")));
    };
    Ok((
        FileMeta {
            number,
            file_size,
            smallest,
            largest,
            entry_count,
        },
        max_seq,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_opts() -> Options {
        Options {
            write_buffer_size: 1 << 16,
            max_file_size: 1 << 16,
            ..Options::default()
        }
    }

    #[test]
    fn put_get_delete() {
        let dir = tempdir().unwrap();
        let db = DB::open(small_opts(), dir.path()).unwrap();
        let w = WriteOptions::default();
        let r = ReadOptions::new();

        db.put(&w, b"foo", b"v1").unwrap();
        assert_eq!(db.get(&r, b"foo").unwrap(), Some(b"v1".to_vec()));
        db.put(&w, b"foo", b"v2").unwrap();
        assert_eq!(db.get(&r, b"foo").unwrap(), Some(b"v2".to_vec()));
        db.delete(&w, b"foo").unwrap();
        assert_eq!(db.get(&r, b"foo").unwrap(), None);
        assert_eq!(db.get(&r, b"never").unwrap(), None);
    }

    #[test]
    fn batch_is_atomic_and_ordered() {
        let dir = tempdir().unwrap();
        let db = DB::open(small_opts(), dir.path()).unwrap();
        let w = WriteOptions::default();
        let r = ReadOptions::new();

        let mut batch = WriteBatch::new();
        batch.put(b"foo", b"a");
        batch.put(b"bar", b"b");
        batch.put(b"box", b"c");
        let mut second = WriteBatch::new();
        second.delete(b"bar");
        batch.append(&second);
        db.write(&w, batch).unwrap();

        assert_eq!(db.get(&r, b"foo").unwrap(), Some(b"a".to_vec()));
        assert_eq!(db.get(&r, b"bar").unwrap(), None);
        assert_eq!(db.get(&r, b"box").unwrap(), Some(b"c".to_vec()));
    }

    #[test]
    fn flush_moves_data_to_level0() {
        let dir = tempdir().unwrap();
        let db = DB::open(small_opts(), dir.path()).unwrap();
        let w = WriteOptions::default();
        let r = ReadOptions::new();

        for i in 0..100 {
            db.put(&w, format!("key{i:04}").as_bytes(), b"value").unwrap();
        }
        db.flush().unwrap();
        assert!(db.num_files_at_level(0) >= 1);
        assert_eq!(db.get(&r, b"key0050").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn reopen_recovers_from_wal() {
        let dir = tempdir().unwrap();
        {
            let db = DB::open(small_opts(), dir.path()).unwrap();
            db.put(&WriteOptions { sync: true }, b"durable", b"yes").unwrap();
        }
        let db = DB::open(small_opts(), dir.path()).unwrap();
        assert_eq!(
            db.get(&ReadOptions::new(), b"durable").unwrap(),
            Some(b"yes".to_vec())
        );
    }

    #[test]
    fn snapshot_pins_old_values() {
        let dir = tempdir().unwrap();
        let db = DB::open(small_opts(), dir.path()).unwrap();
        let w = WriteOptions::default();

        db.put(&w, b"k", b"old").unwrap();
        let snap = db.snapshot();
        db.put(&w, b"k", b"new").unwrap();
        db.delete(&w, b"k2").unwrap();

        let snap_read = ReadOptions {
            snapshot: Some(snap),
            ..ReadOptions::new()
        };
        assert_eq!(db.get(&snap_read, b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(db.get(&ReadOptions::new(), b"k").unwrap(), Some(b"new".to_vec()));
        db.release_snapshot(snap);
    }

    #[test]
    fn error_if_exists_and_create_if_missing() {
        let dir = tempdir().unwrap();
        {
            DB::open(small_opts(), dir.path()).unwrap();
        }
        let opts = Options {
            error_if_exists: true,
            ..small_opts()
        };
        assert!(DB::open(opts, dir.path()).is_err());

        let missing = dir.path().join("nope");
        let opts = Options {
            create_if_missing: false,
            ..small_opts()
        };
        assert!(DB::open(opts, missing).is_err());
    }

    #[test]
    fn properties_report() {
        let dir = tempdir().unwrap();
        let db = DB::open(small_opts(), dir.path()).unwrap();
        db.put(&WriteOptions::default(), b"a", b"b").unwrap();
        db.flush().unwrap();
        assert_eq!(
            db.get_property("lsm-remote.num-files-at-level0"),
            Some("1".to_string())
        );
        assert!(db.get_property("lsm-remote.stats").is_some());
        assert!(db.get_property("lsm-remote.levels").is_some());
        assert!(
            db.get_property("lsm-remote.sstables")
                .is_some_and(|s| s.contains("--- level 0 ---"))
        );
        assert!(db.get_property("other.stats").is_none());
    }

    #[test]
    fn destroy_removes_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = DB::open(small_opts(), &path).unwrap();
            db.put(&WriteOptions::default(), b"a", b"b").unwrap();
            db.flush().unwrap();
        }
        destroy_db(&path, None).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn repair_rebuilds_manifest_from_tables() {
        let dir = tempdir().unwrap();
        {
            let db = DB::open(small_opts(), dir.path()).unwrap();
            db.put(&WriteOptions::default(), b"k1", b"v1").unwrap();
            db.flush().unwrap();
        }
        fs::remove_file(dir.path().join(MANIFEST_NAME)).unwrap();

        let report = repair_db(&small_opts(), dir.path()).unwrap();
        assert_eq!(report.tables_kept, 1);
        assert_eq!(report.tables_dropped, 0);

        let db = DB::open(small_opts(), dir.path()).unwrap();
        assert_eq!(
            db.get(&ReadOptions::new(), b"k1").unwrap(),
            Some(b"v1".to_vec())
        );
    }
}
