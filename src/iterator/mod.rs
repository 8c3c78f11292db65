pub mod merge;

use crate::error::Result;

/// The central iteration abstraction for the storage engine.
///
/// Every sorted data source (skip list, block, sorted file, merged view)
/// implements this trait. Keys yielded are encoded internal keys; sequence
/// filtering and tombstone handling happen above, in the database iterator
/// and the compaction loop.
pub trait StorageIterator: Send {
    /// Returns the current encoded internal key. Only valid when is_valid().
    fn key(&self) -> &[u8];

    /// Returns the current value. Only valid when is_valid().
    fn value(&self) -> &[u8];

    /// Returns true if the iterator is positioned at a valid entry.
    fn is_valid(&self) -> bool;

    /// Advances to the next entry. Returns error on IO/transport failure.
    fn next(&mut self) -> Result<()>;

    /// Moves back to the previous entry.
    fn prev(&mut self) -> Result<()>;

    /// Positions the iterator at the first entry with key >= target.
    fn seek(&mut self, key: &[u8]) -> Result<()>;

    /// Positions the iterator at the first entry.
    fn seek_to_first(&mut self) -> Result<()>;

    /// Positions the iterator at the last entry.
    fn seek_to_last(&mut self) -> Result<()>;
}
