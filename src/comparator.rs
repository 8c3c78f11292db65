//! Pluggable key ordering.
//!
//! The engine never compares keys directly; every ordered structure holds a
//! comparator trait object. The default orders keys byte-wise, which is also
//! what the block/index formats assume when no override is configured.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::types::{extract_tag, extract_user_key};

/// Total order over user keys.
pub trait Comparator: Send + Sync {
    /// Three-way comparison of two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Identifies the ordering. Persisted in the manifest so a database is
    /// never reopened under a different comparator.
    fn name(&self) -> &'static str;
}

/// Default lexicographic byte-wise ordering.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "lsm-remote.BytewiseComparator"
    }
}

/// Orders encoded internal keys: user key ascending per the wrapped user
/// comparator, then tag (sequence, type) descending so the newest version of
/// a key sorts first among duplicates.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => extract_tag(b).cmp(&extract_tag(a)),
            ord => ord,
        }
    }

    fn name(&self) -> &'static str {
        "lsm-remote.InternalKeyComparator"
    }
}
