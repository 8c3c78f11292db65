//! Compaction picking and execution.
//!
//! Compactions always run on the compute node: input tables are pulled
//! through the storage environment, merged locally, and the outputs are
//! written back as fresh regions. Level 0 is scored by file count (each
//! L0 file is another sorted run every read must consult); deeper levels
//! are scored by bytes against a geometric budget. The per-level compact
//! pointer rotates the picked key range so repeated compactions walk the
//! whole level instead of hammering its front.

use std::sync::Arc;

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::env::StorageEnv;
use crate::error::Result;
use crate::iterator::merge::MergeIterator;
use crate::iterator::StorageIterator;
use crate::sstable::builder::TableBuilder;
use crate::sstable::iterator::TableIterator;
use crate::sstable::reader::Table;
use crate::sstable::TableConfig;
use crate::types::{MAX_SEQUENCE, ValueType, extract_sequence, extract_tag, extract_user_key};
use crate::version::edit::VersionEdit;
use crate::version::{FileMeta, NUM_LEVELS, Version, max_bytes_for_level};

/// A picked unit of work: files from `level` plus the overlapping files
/// from `level + 1`.
pub struct Compaction {
    pub level: usize,
    pub inputs: [Vec<Arc<FileMeta>>; 2],
}

impl Compaction {
    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    pub fn total_input_bytes(&self) -> u64 {
        self.inputs
            .iter()
            .flatten()
            .map(|f| f.file_size)
            .sum()
    }

    pub fn num_input_files(&self) -> usize {
        self.inputs[0].len() + self.inputs[1].len()
    }

    /// A single input file with nothing to merge against can be promoted
    /// by metadata edit alone, without rewriting any bytes.
    pub fn is_trivial_move(&self) -> bool {
        self.level > 0 && self.inputs[0].len() == 1 && self.inputs[1].is_empty()
    }

    /// The edit for a trivial move.
    pub fn trivial_move_edit(&self) -> VersionEdit {
        let file = &self.inputs[0][0];
        let mut edit = VersionEdit::new();
        edit.delete_file(self.level, file.number);
        edit.add_file(self.output_level(), (**file).clone());
        edit.set_compact_pointer(self.level, file.largest.clone());
        edit
    }

    /// Internal-key range covered by the level-`level` inputs.
    fn input_range(&self) -> (Vec<u8>, Vec<u8>) {
        range_of(&self.inputs[0])
    }
}

pub(crate) fn range_of(files: &[Arc<FileMeta>]) -> (Vec<u8>, Vec<u8>) {
    let mut smallest = files[0].smallest.clone();
    let mut largest = files[0].largest.clone();
    for f in &files[1..] {
        if f.smallest < smallest {
            smallest = f.smallest.clone();
        }
        if f.largest > largest {
            largest = f.largest.clone();
        }
    }
    (smallest, largest)
}

/// Pressure on one level. A score >= 1.0 means "needs compaction".
///
/// Level 0 is scored by file count, since every L0 file is another
/// sorted run a read must consult; deeper levels by bytes over budget.
pub fn level_score(version: &Version, level: usize, l0_trigger: usize) -> f64 {
    if level == 0 {
        version.num_files(0) as f64 / l0_trigger as f64
    } else {
        version.level_bytes(level) as f64 / max_bytes_for_level(level) as f64
    }
}

/// Every level over budget, highest score first.
pub fn pick_levels(version: &Version, l0_trigger: usize) -> Vec<(usize, f64)> {
    let mut over: Vec<(usize, f64)> = (0..NUM_LEVELS - 1)
        .map(|level| (level, level_score(version, level, l0_trigger)))
        .filter(|(_, score)| *score >= 1.0)
        .collect();
    over.sort_by(|a, b| b.1.total_cmp(&a.1));
    over
}

/// Highest-scoring level that is over budget, if any.
pub fn pick_level(version: &Version, l0_trigger: usize) -> Option<(usize, f64)> {
    pick_levels(version, l0_trigger).into_iter().next()
}

/// Pick the inputs for a compaction of `level`.
///
/// Starts from the first file past the level's compact pointer (wrapping
/// to the front), expands within L0 to cover transitively overlapping
/// files, then pulls in every overlapping file from the level below.
pub fn pick_compaction(
    icmp: &InternalKeyComparator,
    version: &Version,
    level: usize,
    compact_pointer: &[u8],
) -> Option<Compaction> {
    let files = &version.files[level];
    if files.is_empty() {
        return None;
    }

    let seed = files
        .iter()
        .find(|f| {
            compact_pointer.is_empty() || icmp.compare(&f.largest, compact_pointer).is_gt()
        })
        .unwrap_or(&files[0]);
    let mut inputs0 = vec![Arc::clone(seed)];

    let ucmp = icmp.user_comparator();
    if level == 0 {
        // L0 files overlap each other; grow the set to a fixed point so
        // the output is a complete merge of the covered range.
        loop {
            let begin = inputs0
                .iter()
                .map(|f| extract_user_key(&f.smallest).to_vec())
                .min_by(|a, b| ucmp.compare(a, b))?;
            let end = inputs0
                .iter()
                .map(|f| extract_user_key(&f.largest).to_vec())
                .max_by(|a, b| ucmp.compare(a, b))?;
            let expanded =
                version.overlapping_files(ucmp.as_ref(), 0, Some(&begin), Some(&end));
            if expanded.len() == inputs0.len() {
                break;
            }
            inputs0 = expanded;
        }
    }

    let (smallest, largest) = range_of(&inputs0);
    let inputs1 = version.overlapping_files(
        ucmp.as_ref(),
        level + 1,
        Some(extract_user_key(&smallest)),
        Some(extract_user_key(&largest)),
    );
    Some(Compaction {
        level,
        inputs: [inputs0, inputs1],
    })
}

/// Everything a compaction needs from the engine.
pub struct CompactionEnv<'a> {
    pub icmp: Arc<InternalKeyComparator>,
    pub env: &'a dyn StorageEnv,
    pub table_cfg: TableConfig,
    /// Open an input table by file number (normally via the table cache).
    pub open_table: &'a dyn Fn(u64) -> Result<Arc<Table>>,
    /// Mint a file number for each output.
    pub new_file_number: &'a dyn Fn() -> u64,
    /// Region name for a file number.
    pub region_name: &'a dyn Fn(u64) -> String,
    /// Entries at or below this sequence that are shadowed may be dropped.
    pub smallest_live_sequence: u64,
    /// Cut an output once it grows past this.
    pub max_output_bytes: u64,
}

#[derive(Debug, Default)]
pub struct CompactionStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub output_files: usize,
    pub entries_dropped: u64,
}

/// Merge the inputs and write the outputs, returning the version edit
/// that installs them. Output regions that were written before a later
/// failure are the caller's to clean up; the edit is only returned on
/// full success.
pub fn run_compaction(
    c: &Compaction,
    ctx: &CompactionEnv<'_>,
    base: &Version,
) -> Result<(VersionEdit, CompactionStats)> {
    let mut stats = CompactionStats {
        bytes_read: c.total_input_bytes(),
        ..CompactionStats::default()
    };

    let mut children: Vec<Box<dyn StorageIterator>> = Vec::new();
    for file in c.inputs.iter().flatten() {
        let table = (ctx.open_table)(file.number)?;
        children.push(Box::new(TableIterator::new(table, true, false)));
    }
    let cmp: Arc<dyn Comparator> = ctx.icmp.clone();
    let mut merged = MergeIterator::new(cmp, children);
    merged.seek_to_first()?;

    let ucmp = ctx.icmp.user_comparator().clone();
    let mut outputs: Vec<FileMeta> = Vec::new();
    let mut builder: Option<(u64, TableBuilder)> = None;

    // Sequence of the previous entry for the current user key; MAX means
    // "this is the first (newest) occurrence".
    let mut last_user_key: Option<Vec<u8>> = None;
    let mut last_sequence_for_key = MAX_SEQUENCE;

    while merged.is_valid() {
        let key = merged.key().to_vec();
        let user_key = extract_user_key(&key);
        let sequence = extract_sequence(&key);
        let (_, value_type) = crate::types::unpack_tag(extract_tag(&key))?;

        if last_user_key
            .as_deref()
            .is_none_or(|last| ucmp.compare(last, user_key).is_ne())
        {
            last_user_key = Some(user_key.to_vec());
            last_sequence_for_key = MAX_SEQUENCE;
        }

        let drop = if last_sequence_for_key <= ctx.smallest_live_sequence {
            // A newer entry for this key is already visible to every
            // live snapshot; this one can never be observed again.
            true
        } else {
            value_type == ValueType::Delete
                && sequence <= ctx.smallest_live_sequence
                && is_base_level_for_key(base, ucmp.as_ref(), c.output_level(), user_key)
        };
        last_sequence_for_key = sequence;

        if drop {
            stats.entries_dropped += 1;
        } else {
            if builder.is_none() {
                let number = (ctx.new_file_number)();
                let region = ctx.env.create_region(&(ctx.region_name)(number))?;
                builder = Some((number, TableBuilder::new(region, ctx.table_cfg.clone())));
            }
            let mut cut = false;
            if let Some((_, b)) = builder.as_mut() {
                b.add(&key, merged.value())?;
                cut = b.estimated_size() >= ctx.max_output_bytes;
            }
            if cut {
                if let Some((number, b)) = builder.take() {
                    finish_output(number, b, &mut outputs, &mut stats)?;
                }
            }
        }
        merged.next()?;
    }

    if let Some((number, b)) = builder.take() {
        finish_output(number, b, &mut outputs, &mut stats)?;
    }

    let mut edit = VersionEdit::new();
    for (which, level) in [(0, c.level), (1, c.output_level())] {
        for file in &c.inputs[which] {
            edit.delete_file(level, file.number);
        }
    }
    for meta in outputs {
        edit.add_file(c.output_level(), meta);
    }
    let (_, largest) = c.input_range();
    edit.set_compact_pointer(c.level, largest);
    Ok((edit, stats))
}

fn finish_output(
    number: u64,
    builder: TableBuilder,
    outputs: &mut Vec<FileMeta>,
    stats: &mut CompactionStats,
) -> Result<()> {
    if builder.entry_count() == 0 {
        return Ok(());
    }
    let handle = builder.finish()?;
    stats.bytes_written += handle.file_size;
    stats.output_files += 1;
    outputs.push(FileMeta {
        number,
        file_size: handle.file_size,
        smallest: handle.smallest,
        largest: handle.largest,
        entry_count: handle.entry_count,
    });
    Ok(())
}

/// True when no level strictly below `output_level` can contain
/// `user_key`, so a sufficiently old tombstone has nothing left to cover.
fn is_base_level_for_key(
    version: &Version,
    ucmp: &dyn Comparator,
    output_level: usize,
    user_key: &[u8],
) -> bool {
    let key = Some(user_key);
    for level in output_level + 1..NUM_LEVELS {
        for file in &version.files[level] {
            if file.user_range_overlaps(ucmp, key, key) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::types::encode_internal_key;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn meta(number: u64, smallest: &[u8], largest: &[u8], size: u64) -> Arc<FileMeta> {
        Arc::new(FileMeta {
            number,
            file_size: size,
            smallest: encode_internal_key(smallest, 1, ValueType::Put),
            largest: encode_internal_key(largest, 1, ValueType::Put),
            entry_count: 10,
        })
    }

    #[test]
    fn l0_scored_by_file_count() {
        let mut v = Version::empty();
        for n in 1..=4 {
            v.files[0].push(meta(n, b"a", b"z", 100));
        }
        let (level, score) = pick_level(&v, 4).unwrap();
        assert_eq!(level, 0);
        assert!(score >= 1.0);
        assert!(pick_level(&Version::empty(), 4).is_none());
    }

    #[test]
    fn deeper_levels_scored_by_bytes() {
        let mut v = Version::empty();
        v.files[1].push(meta(1, b"a", b"m", 11 * 1024 * 1024));
        let (level, _) = pick_level(&v, 4).unwrap();
        assert_eq!(level, 1);

        let mut small = Version::empty();
        small.files[1].push(meta(1, b"a", b"m", 1024));
        assert!(pick_level(&small, 4).is_none());
    }

    #[test]
    fn l0_inputs_expand_to_overlap_closure() {
        let cmp = icmp();
        let mut v = Version::empty();
        v.files[0].push(meta(3, b"k", b"p", 100));
        v.files[0].push(meta(2, b"f", b"l", 100));
        v.files[0].push(meta(1, b"a", b"g", 100));
        // b"t".."z" does not touch the chain.
        v.files[0].push(meta(4, b"t", b"z", 100));

        let c = pick_compaction(&cmp, &v, 0, b"").unwrap();
        // Seed is the first file; overlap closure pulls 1, 2, 3 together.
        let mut numbers: Vec<u64> = c.inputs[0].iter().map(|f| f.number).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn picks_overlapping_next_level_files() {
        let cmp = icmp();
        let mut v = Version::empty();
        v.files[1].push(meta(5, b"d", b"k", 100));
        v.files[2].push(meta(6, b"a", b"e", 100));
        v.files[2].push(meta(7, b"f", b"j", 100));
        v.files[2].push(meta(8, b"x", b"z", 100));

        let c = pick_compaction(&cmp, &v, 1, b"").unwrap();
        let numbers: Vec<u64> = c.inputs[1].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![6, 7]);
        assert!(!c.is_trivial_move());
    }

    #[test]
    fn trivial_move_when_no_overlap() {
        let cmp = icmp();
        let mut v = Version::empty();
        v.files[1].push(meta(5, b"d", b"k", 100));
        v.files[2].push(meta(8, b"x", b"z", 100));

        let c = pick_compaction(&cmp, &v, 1, b"").unwrap();
        assert!(c.is_trivial_move());
        let edit = c.trivial_move_edit();
        assert_eq!(edit.deleted_files, vec![(1, 5)]);
        assert_eq!(edit.new_files.len(), 1);
        assert_eq!(edit.new_files[0].0, 2);
    }

    #[test]
    fn compact_pointer_rotates_and_wraps() {
        let cmp = icmp();
        let mut v = Version::empty();
        v.files[1].push(meta(1, b"a", b"f", 100));
        v.files[1].push(meta(2, b"g", b"p", 100));

        let after_first = encode_internal_key(b"f", 1, ValueType::Put);
        let c = pick_compaction(&cmp, &v, 1, &after_first).unwrap();
        assert_eq!(c.inputs[0][0].number, 2);

        // Pointer past the last file wraps to the front.
        let past_end = encode_internal_key(b"zzz", 1, ValueType::Put);
        let c = pick_compaction(&cmp, &v, 1, &past_end).unwrap();
        assert_eq!(c.inputs[0][0].number, 1);
    }

    #[test]
    fn compact_pointer_respects_custom_comparator() {
        struct ReverseComparator;
        impl Comparator for ReverseComparator {
            fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
                b.cmp(a)
            }
            fn name(&self) -> &'static str {
                "test.ReverseComparator"
            }
        }

        // Under the reverse order the level runs z..t then s..m.
        let cmp = InternalKeyComparator::new(Arc::new(ReverseComparator));
        let mut v = Version::empty();
        v.files[1].push(meta(1, b"z", b"t", 100));
        v.files[1].push(meta(2, b"s", b"m", 100));

        // Pointer at the first file's largest key: the next round must
        // seed from file 2, which byte order would never reach.
        let pointer = encode_internal_key(b"t", 1, ValueType::Put);
        let c = pick_compaction(&cmp, &v, 1, &pointer).unwrap();
        assert_eq!(c.inputs[0][0].number, 2);
    }

    #[test]
    fn base_level_check_scans_deeper_levels() {
        let ucmp = BytewiseComparator;
        let mut v = Version::empty();
        v.files[3].push(meta(9, b"m", b"q", 100));
        assert!(is_base_level_for_key(&v, &ucmp, 2, b"a"));
        assert!(!is_base_level_for_key(&v, &ucmp, 2, b"n"));
        // The output level itself does not count.
        assert!(is_base_level_for_key(&v, &ucmp, 3, b"n"));
    }
}
