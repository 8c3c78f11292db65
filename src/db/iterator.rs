//! User-facing iteration over the whole database.
//!
//! Wraps a merge of the memtables and every table in a pinned version,
//! then collapses internal entries into user-visible ones: entries newer
//! than the iterator's sequence are invisible, only the newest visible
//! entry per user key counts, and a tombstone hides the key entirely.
//! The pinned generation keeps the underlying files alive for the whole
//! life of the iterator, compactions notwithstanding.

use std::sync::Arc;

use crate::comparator::Comparator;
use crate::db::DbInner;
use crate::error::Result;
use crate::iterator::StorageIterator;
use crate::iterator::merge::MergeIterator;
use crate::types::{
    ValueType, extract_sequence, extract_tag, extract_user_key, lookup_key, unpack_tag,
};

#[derive(PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

pub struct DBIterator {
    db: Arc<DbInner>,
    generation: u64,
    iter: MergeIterator,
    ucmp: Arc<dyn Comparator>,
    sequence: u64,
    direction: Direction,
    valid: bool,
    /// Current user key (and value) when valid; scratch otherwise.
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
}

impl DBIterator {
    pub(crate) fn new(
        db: Arc<DbInner>,
        generation: u64,
        iter: MergeIterator,
        sequence: u64,
    ) -> Self {
        let ucmp = Arc::clone(db.icmp.user_comparator());
        DBIterator {
            db,
            generation,
            iter,
            ucmp,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key. Only meaningful while `valid()`.
    pub fn key(&self) -> &[u8] {
        &self.saved_key
    }

    pub fn value(&self) -> &[u8] {
        &self.saved_value
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.direction = Direction::Forward;
        self.iter.seek_to_first()?;
        self.find_next_user_entry(false, Vec::new())
    }

    pub fn seek_to_last(&mut self) -> Result<()> {
        self.direction = Direction::Reverse;
        self.iter.seek_to_last()?;
        self.find_prev_user_entry()
    }

    /// Position at the first user key >= `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.direction = Direction::Forward;
        self.iter.seek(&lookup_key(target, self.sequence))?;
        self.find_next_user_entry(false, Vec::new())
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        if self.direction == Direction::Reverse {
            // In reverse mode the merge iterator sits just before the
            // entries of the current key; step onto them.
            self.direction = Direction::Forward;
            if self.iter.is_valid() {
                self.iter.next()?;
            } else {
                self.iter.seek_to_first()?;
            }
            if !self.iter.is_valid() {
                self.valid = false;
                self.saved_key.clear();
                return Ok(());
            }
        }
        let skip = extract_user_key(self.iter.key()).to_vec();
        self.find_next_user_entry(true, skip)
    }

    pub fn prev(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        if self.direction == Direction::Forward {
            // Back off the merge iterator until it is before every entry
            // of the current key.
            loop {
                self.iter.prev()?;
                if !self.iter.is_valid() {
                    break;
                }
                if self
                    .ucmp
                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                    .is_lt()
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
            if !self.iter.is_valid() {
                self.valid = false;
                self.saved_key.clear();
                self.saved_value.clear();
                return Ok(());
            }
        }
        self.find_prev_user_entry()
    }

    /// Scan forward for the newest visible non-deleted entry, skipping
    /// keys at or below `skip` while `skipping` holds.
    fn find_next_user_entry(&mut self, mut skipping: bool, mut skip: Vec<u8>) -> Result<()> {
        loop {
            if !self.iter.is_valid() {
                self.valid = false;
                self.saved_key.clear();
                return Ok(());
            }
            let ikey = self.iter.key();
            if extract_sequence(ikey) <= self.sequence {
                let (_, value_type) = unpack_tag(extract_tag(ikey))?;
                let user_key = extract_user_key(ikey);
                match value_type {
                    ValueType::Delete => {
                        // Hide every older entry of this key.
                        skip = user_key.to_vec();
                        skipping = true;
                    }
                    ValueType::Put => {
                        if !(skipping && self.ucmp.compare(user_key, &skip).is_le()) {
                            self.valid = true;
                            self.saved_key = user_key.to_vec();
                            self.saved_value = self.iter.value().to_vec();
                            return Ok(());
                        }
                    }
                }
            }
            self.iter.next()?;
        }
    }

    /// Scan backward, accumulating the newest visible entry of the
    /// nearest preceding key. Within one user key, reverse order visits
    /// oldest first, so the last overwrite wins.
    fn find_prev_user_entry(&mut self) -> Result<()> {
        let mut value_type = ValueType::Delete;
        self.saved_key.clear();
        self.saved_value.clear();
        loop {
            if !self.iter.is_valid() {
                break;
            }
            let ikey = self.iter.key();
            if extract_sequence(ikey) <= self.sequence {
                let (_, vt) = unpack_tag(extract_tag(ikey))?;
                let user_key = extract_user_key(ikey);
                if value_type != ValueType::Delete
                    && self.ucmp.compare(user_key, &self.saved_key).is_lt()
                {
                    // The saved entry is the complete answer for its key.
                    break;
                }
                value_type = vt;
                match vt {
                    ValueType::Delete => {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    }
                    ValueType::Put => {
                        self.saved_key = user_key.to_vec();
                        self.saved_value = self.iter.value().to_vec();
                    }
                }
            }
            self.iter.prev()?;
        }
        if value_type == ValueType::Delete {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
        Ok(())
    }
}

impl Drop for DBIterator {
    fn drop(&mut self) {
        self.db.release_version(self.generation);
    }
}
