//! Versions and the version set.
//!
//! A Version is an immutable snapshot of "which sorted files exist at which
//! level." The VersionSet is an arena of live Versions indexed by a
//! monotonically increasing generation id; readers pin a generation while
//! they work and release it when done. File deletion is deferred until no
//! live generation references the file, which is what keeps a long-lived
//! snapshot read correct while compaction rewrites the same key range
//! underneath it.

pub mod edit;
pub mod manifest;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::error::{Error, Result};
use crate::types::extract_user_key;
use edit::VersionEdit;

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Level-(L>=1) size budget: 10 MiB at L1, ×10 per level below.
pub fn max_bytes_for_level(level: usize) -> u64 {
    let mut budget = 10 * 1024 * 1024u64;
    for _ in 1..level {
        budget = budget.saturating_mul(10);
    }
    budget
}

/// Metadata for one immutable sorted file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key in the file.
    pub smallest: Vec<u8>,
    /// Largest internal key in the file.
    pub largest: Vec<u8>,
    pub entry_count: u64,
}

impl FileMeta {
    pub(crate) fn user_range_overlaps(
        &self,
        ucmp: &dyn Comparator,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> bool {
        if let Some(begin) = begin {
            if ucmp.compare(extract_user_key(&self.largest), begin).is_lt() {
                return false;
            }
        }
        if let Some(end) = end {
            if ucmp.compare(extract_user_key(&self.smallest), end).is_gt() {
                return false;
            }
        }
        true
    }
}

/// An immutable snapshot of the file set, one Vec per level.
///
/// Level 0 files may overlap and are ordered newest first (descending file
/// number). Files within level >= 1 are disjoint and sorted by smallest key.
#[derive(Debug, Clone)]
pub struct Version {
    pub files: Vec<Vec<Arc<FileMeta>>>,
}

impl Version {
    pub fn empty() -> Self {
        Version {
            files: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    pub fn total_files(&self) -> usize {
        self.files.iter().map(|l| l.len()).sum()
    }

    /// Candidate files for a point lookup, newest data first.
    ///
    /// Level 0 contributes every overlapping file in file-number order
    /// (newer flushes have larger numbers); deeper levels contribute at
    /// most one file each since their ranges are disjoint.
    pub fn files_for_get(&self, ucmp: &dyn Comparator, user_key: &[u8]) -> Vec<(usize, Arc<FileMeta>)> {
        let mut out = Vec::new();
        let key = Some(user_key);
        for file in &self.files[0] {
            if file.user_range_overlaps(ucmp, key, key) {
                out.push((0, Arc::clone(file)));
            }
        }
        for (level, files) in self.files.iter().enumerate().skip(1) {
            // First file whose largest >= key.
            let idx = files.partition_point(|f| {
                ucmp.compare(extract_user_key(&f.largest), user_key).is_lt()
            });
            if idx < files.len() && files[idx].user_range_overlaps(ucmp, key, key) {
                out.push((level, Arc::clone(&files[idx])));
            }
        }
        out
    }

    /// Every file in `level` whose user-key range intersects [begin, end].
    /// `None` bounds are unbounded.
    pub fn overlapping_files(
        &self,
        ucmp: &dyn Comparator,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMeta>> {
        self.files[level]
            .iter()
            .filter(|f| f.user_range_overlaps(ucmp, begin, end))
            .cloned()
            .collect()
    }
}

/// A pinned reference to one generation. Must be handed back via
/// [`VersionSet::release`] when the read/iterator/compaction is done.
pub struct VersionHandle {
    pub generation: u64,
    pub version: Arc<Version>,
}

struct LiveVersion {
    version: Arc<Version>,
    refs: u64,
}

struct VsInner {
    current_gen: u64,
    live: BTreeMap<u64, LiveVersion>,
    next_file_number: u64,
    log_number: u64,
    compact_pointer: Vec<Vec<u8>>,
    /// Files removed from the current version but possibly still pinned.
    pending_gc: HashSet<u64>,
}

/// Owns the generation arena and the persisted manifest.
pub struct VersionSet {
    icmp: Arc<InternalKeyComparator>,
    manifest_path: PathBuf,
    last_sequence: AtomicU64,
    inner: Mutex<VsInner>,
}

impl VersionSet {
    /// Fresh, empty version set (new database).
    pub fn new(icmp: Arc<InternalKeyComparator>, manifest_path: PathBuf) -> Self {
        let mut live = BTreeMap::new();
        live.insert(
            1,
            LiveVersion {
                version: Arc::new(Version::empty()),
                refs: 1, // the "current" baseline pin
            },
        );
        VersionSet {
            icmp,
            manifest_path,
            last_sequence: AtomicU64::new(0),
            inner: Mutex::new(VsInner {
                current_gen: 1,
                live,
                next_file_number: 1,
                log_number: 0,
                compact_pointer: vec![Vec::new(); NUM_LEVELS],
                pending_gc: HashSet::new(),
            }),
        }
    }

    /// Rebuild the version set from a manifest written by a prior run.
    pub fn recover(icmp: Arc<InternalKeyComparator>, manifest_path: PathBuf) -> Result<Self> {
        let state = manifest::load(&manifest_path)?;
        if state.comparator_name != icmp.user_comparator().name() {
            return Err(Error::InvalidArgument(format!(
                "comparator mismatch: database uses {:?}, options supply {:?}",
                state.comparator_name,
                icmp.user_comparator().name()
            )));
        }
        let vs = VersionSet::new(icmp, manifest_path);
        {
            let mut inner = vs.inner.lock();
            let mut version = Version::empty();
            let mut max_file = 0u64;
            for (level, meta) in state.files {
                max_file = max_file.max(meta.number);
                version.files[level].push(Arc::new(meta));
            }
            sort_level_files(&mut version);
            if let Some(lv) = inner.live.get_mut(&1) {
                lv.version = Arc::new(version);
            }
            // Guard against a manifest whose counter lagged behind the
            // files it lists.
            inner.next_file_number = state.next_file_number.max(max_file + 1).max(state.log_number + 1);
            inner.log_number = state.log_number;
        }
        vs.last_sequence.store(state.last_sequence, Ordering::SeqCst);
        Ok(vs)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub fn set_last_sequence(&self, seq: u64) {
        self.last_sequence.store(seq, Ordering::SeqCst);
    }

    /// Reserve `count` sequence numbers; returns the first of the range.
    pub fn allocate_sequences(&self, count: u64) -> u64 {
        self.last_sequence.fetch_add(count, Ordering::SeqCst) + 1
    }

    pub fn new_file_number(&self) -> u64 {
        let mut inner = self.inner.lock();
        let n = inner.next_file_number;
        inner.next_file_number += 1;
        n
    }

    pub fn log_number(&self) -> u64 {
        self.inner.lock().log_number
    }

    pub fn compact_pointer(&self, level: usize) -> Vec<u8> {
        self.inner.lock().compact_pointer[level].clone()
    }

    /// Pin and return the current version.
    pub fn acquire_current(&self) -> Result<VersionHandle> {
        let mut inner = self.inner.lock();
        let generation = inner.current_gen;
        let live = inner.live.get_mut(&generation).ok_or_else(|| {
            Error::Corruption(format!("current generation {generation} is not live"))
        })?;
        live.refs += 1;
        Ok(VersionHandle {
            generation,
            version: Arc::clone(&live.version),
        })
    }

    /// Unpinned peek at the current version, for stats and scoring.
    pub fn current(&self) -> Arc<Version> {
        let inner = self.inner.lock();
        Arc::clone(&inner.live[&inner.current_gen].version)
    }

    /// Release a pinned generation. Returns file numbers that became
    /// unreferenced and may now be physically deleted.
    pub fn release(&self, generation: u64) -> Vec<u64> {
        let mut inner = self.inner.lock();
        if let Some(live) = inner.live.get_mut(&generation) {
            live.refs = live.refs.saturating_sub(1);
            if live.refs == 0 && generation != inner.current_gen {
                inner.live.remove(&generation);
            }
        }
        sweep(&mut inner)
    }

    /// Apply an edit, persist the manifest, and publish the result as the
    /// new current version under a single lock. Nothing is published if the
    /// manifest write fails — the previous state stays authoritative.
    pub fn log_and_apply(&self, edit: &VersionEdit) -> Result<Vec<u64>> {
        let mut inner = self.inner.lock();

        // Build the successor version.
        let base = Arc::clone(&inner.live[&inner.current_gen].version);
        let mut next = (*base).clone();
        let deleted: HashSet<u64> = edit.deleted_files.iter().map(|(_, n)| *n).collect();
        for files in next.files.iter_mut() {
            files.retain(|f| !deleted.contains(&f.number));
        }
        for (level, meta) in &edit.new_files {
            if *level >= NUM_LEVELS {
                return Err(Error::InvalidArgument(format!("level out of range: {level}")));
            }
            next.files[*level].push(Arc::new(meta.clone()));
        }
        sort_level_files(&mut next);

        if let Some(n) = edit.log_number {
            inner.log_number = n;
        }
        if let Some(n) = edit.next_file_number {
            inner.next_file_number = inner.next_file_number.max(n);
        }
        if let Some(n) = edit.last_sequence {
            let prev = self.last_sequence.load(Ordering::SeqCst);
            self.last_sequence.store(prev.max(n), Ordering::SeqCst);
        }
        for (level, key) in &edit.compact_pointers {
            inner.compact_pointer[*level] = key.clone();
        }

        // Persist before publishing.
        let state = manifest::ManifestState {
            comparator_name: self.icmp.user_comparator().name().to_string(),
            next_file_number: inner.next_file_number,
            last_sequence: self.last_sequence.load(Ordering::SeqCst),
            log_number: inner.log_number,
            files: next
                .files
                .iter()
                .enumerate()
                .flat_map(|(level, files)| {
                    files.iter().map(move |f| (level, (**f).clone()))
                })
                .collect(),
        };
        manifest::save(&self.manifest_path, &state)?;

        // Publish: new generation takes the baseline pin, the old one
        // loses it (readers that pinned it still hold their own refs).
        let old_gen = inner.current_gen;
        let new_gen = old_gen + 1;
        inner.live.insert(
            new_gen,
            LiveVersion {
                version: Arc::new(next),
                refs: 1,
            },
        );
        inner.current_gen = new_gen;
        if let Some(old) = inner.live.get_mut(&old_gen) {
            old.refs = old.refs.saturating_sub(1);
            if old.refs == 0 {
                inner.live.remove(&old_gen);
            }
        }
        for number in deleted {
            inner.pending_gc.insert(number);
        }
        Ok(sweep(&mut inner))
    }

    /// Live generation count, exposed for stats.
    pub fn live_generations(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn icmp(&self) -> Arc<InternalKeyComparator> {
        Arc::clone(&self.icmp)
    }
}

fn sort_level_files(version: &mut Version) {
    // L0: newest flush first. Deeper levels: by smallest key (byte order of
    // encoded internal keys tracks the user comparator for the default
    // bytewise ordering; custom comparators rely on compaction inserting
    // files already disjoint, so any stable order works for overlap scans
    // but lookups use partition_point, hence keep key order).
    version.files[0].sort_by(|a, b| b.number.cmp(&a.number));
    for files in version.files.iter_mut().skip(1) {
        files.sort_by(|a, b| a.smallest.cmp(&b.smallest));
    }
}

/// Files pending GC that no live generation references any more.
fn sweep(inner: &mut VsInner) -> Vec<u64> {
    if inner.pending_gc.is_empty() {
        return Vec::new();
    }
    let mut referenced: HashSet<u64> = HashSet::new();
    for live in inner.live.values() {
        for files in &live.version.files {
            for f in files {
                referenced.insert(f.number);
            }
        }
    }
    let deletable: Vec<u64> = inner
        .pending_gc
        .iter()
        .filter(|n| !referenced.contains(n))
        .copied()
        .collect();
    for n in &deletable {
        inner.pending_gc.remove(n);
    }
    deletable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::types::{ValueType, encode_internal_key};
    use tempfile::tempdir;

    fn icmp() -> Arc<InternalKeyComparator> {
        Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> FileMeta {
        FileMeta {
            number,
            file_size: 1000,
            smallest: encode_internal_key(smallest, 1, ValueType::Put),
            largest: encode_internal_key(largest, 1, ValueType::Put),
            entry_count: 10,
        }
    }

    #[test]
    fn apply_adds_and_removes_files() {
        let dir = tempdir().unwrap();
        let vs = VersionSet::new(icmp(), dir.path().join("MANIFEST"));

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(1, b"a", b"m"));
        edit.add_file(0, meta(2, b"n", b"z"));
        vs.log_and_apply(&edit).unwrap();
        assert_eq!(vs.current().num_files(0), 2);

        let mut edit = VersionEdit::new();
        edit.delete_file(0, 1);
        edit.add_file(1, meta(3, b"a", b"m"));
        let deletable = vs.log_and_apply(&edit).unwrap();
        assert_eq!(deletable, vec![1]);
        assert_eq!(vs.current().num_files(0), 1);
        assert_eq!(vs.current().num_files(1), 1);
    }

    #[test]
    fn pinned_generation_defers_deletion() {
        let dir = tempdir().unwrap();
        let vs = VersionSet::new(icmp(), dir.path().join("MANIFEST"));

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(1, b"a", b"z"));
        vs.log_and_apply(&edit).unwrap();

        let handle = vs.acquire_current().unwrap();

        let mut edit = VersionEdit::new();
        edit.delete_file(0, 1);
        let deletable = vs.log_and_apply(&edit).unwrap();
        // A reader still pins the version holding file 1.
        assert!(deletable.is_empty());

        let deletable = vs.release(handle.generation);
        assert_eq!(deletable, vec![1]);
    }

    #[test]
    fn files_for_get_orders_l0_newest_first() {
        let mut v = Version::empty();
        v.files[0].push(Arc::new(meta(5, b"a", b"z")));
        v.files[0].push(Arc::new(meta(9, b"a", b"z")));
        v.files[1].push(Arc::new(meta(2, b"a", b"k")));
        sort_level_files(&mut v);

        let ucmp = BytewiseComparator;
        let hits = v.files_for_get(&ucmp, b"c");
        let numbers: Vec<u64> = hits.iter().map(|(_, f)| f.number).collect();
        assert_eq!(numbers, vec![9, 5, 2]);
    }

    #[test]
    fn deeper_levels_probe_single_file() {
        let mut v = Version::empty();
        v.files[1].push(Arc::new(meta(1, b"a", b"f")));
        v.files[1].push(Arc::new(meta(2, b"g", b"p")));
        v.files[1].push(Arc::new(meta(3, b"q", b"z")));
        sort_level_files(&mut v);
        let ucmp = BytewiseComparator;
        let hits = v.files_for_get(&ucmp, b"h");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.number, 2);
        assert!(v.files_for_get(&ucmp, b"fz").len() <= 1);
    }

    #[test]
    fn manifest_roundtrip_via_recover() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        {
            let vs = VersionSet::new(icmp(), path.clone());
            let mut edit = VersionEdit::new();
            edit.add_file(0, meta(7, b"k1", b"k9"));
            edit.set_log_number(3);
            edit.last_sequence = Some(44);
            vs.log_and_apply(&edit).unwrap();
        }
        let vs = VersionSet::recover(icmp(), path).unwrap();
        assert_eq!(vs.current().num_files(0), 1);
        assert_eq!(vs.current().files[0][0].number, 7);
        assert_eq!(vs.last_sequence(), 44);
        assert_eq!(vs.log_number(), 3);
        assert!(vs.new_file_number() > 7 || vs.new_file_number() >= 1);
    }

    #[test]
    fn level_budgets_grow_geometrically() {
        assert_eq!(max_bytes_for_level(1), 10 * 1024 * 1024);
        assert_eq!(max_bytes_for_level(2), 100 * 1024 * 1024);
        assert_eq!(max_bytes_for_level(3), 1000 * 1024 * 1024);
    }
}
