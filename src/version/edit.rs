use crate::version::FileMeta;

/// An immutable description of one state transition of the file set:
/// files added and removed per level, plus counters to persist.
///
/// Applying an edit to the current version produces the next version;
/// the edit itself is never mutated after being built by a flush or
/// compaction job.
#[derive(Debug, Default, Clone)]
pub struct VersionEdit {
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Per-level "next key to compact" checkpoints (round-robin pointer).
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    /// (level, file number) pairs consumed by a compaction.
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, FileMeta)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        VersionEdit::default()
    }

    pub fn add_file(&mut self, level: usize, meta: FileMeta) -> &mut Self {
        self.new_files.push((level, meta));
        self
    }

    pub fn delete_file(&mut self, level: usize, number: u64) -> &mut Self {
        self.deleted_files.push((level, number));
        self
    }

    pub fn set_log_number(&mut self, n: u64) -> &mut Self {
        self.log_number = Some(n);
        self
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: Vec<u8>) -> &mut Self {
        self.compact_pointers.push((level, key));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.log_number.is_none()
            && self.next_file_number.is_none()
            && self.last_sequence.is_none()
            && self.compact_pointers.is_empty()
            && self.deleted_files.is_empty()
            && self.new_files.is_empty()
    }
}
