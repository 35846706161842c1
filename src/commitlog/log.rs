use bytes::Bytes;
use std::{fmt, io};

/// Index is an index of an entry in the log; i.e. a log entry's index.
///
/// Entries are indexed starting from 1. Index 0 is the position "before the first entry", and is
/// what an empty log reports as its last index.
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(u64);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    pub fn zero() -> Self {
        Index(0)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.0 + delta)
    }

    /// Saturates at zero.
    pub fn minus(&self, delta: u64) -> Index {
        Index::new(self.0.saturating_sub(delta))
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.0.checked_sub(delta).map(Index::new)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub data: Bytes,
    pub flags: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StructureKind {
    OrderedMap,
    Table,
}

/// A top-level structure persisted by the storage engine which may be shipped to a follower as
/// part of a full state transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedStructure {
    pub kind: StructureKind,
    pub key: Bytes,
}

pub type MapEntryIter<'a> = Box<dyn Iterator<Item = Result<(Bytes, Bytes), io::Error>> + Send + 'a>;
pub type TableRowIter<'a> = Box<dyn Iterator<Item = Result<Bytes, io::Error>> + Send + 'a>;
pub type LogEntryIter<'a> = Box<dyn Iterator<Item = Result<LogEntry, io::Error>> + Send + 'a>;

/// LogStore is the leader's durable, replicated log plus the state it has been compacted into.
///
/// Replication only ever reads from the store through a `ReadTransaction`. The one write exposed
/// here is the commit index, which only the leader's aggregator advances.
pub trait LogStore: Send + Sync + 'static {
    /// Open a consistent, point-in-time view of the store. Everything read through the returned
    /// transaction reflects the same moment, regardless of concurrent appends or compaction.
    fn read_transaction(&self) -> Result<Box<dyn ReadTransaction>, io::Error>;

    /// Advance the committed index. Implementations must ignore non-increasing values.
    fn set_committed_index(&self, index: Index) -> Result<(), io::Error>;
}

pub trait ReadTransaction: Send + Sync {
    /// Term of the entry at `index`. Index 0 is always term 0. The entry immediately preceding
    /// the first retained entry is still answerable; anything older was compacted and is `None`.
    fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error>;

    /// Index of the oldest entry still retained in the log. When the log is empty this is the
    /// index the next append would use.
    fn first_entry_index(&self) -> Index;

    fn last_entry_index(&self) -> Index;

    fn committed_index(&self) -> Index;

    /// Iterate entries in order starting at `index`, through the end of the log.
    fn entries_from(&self, index: Index) -> LogEntryIter<'_>;

    /// Every top-level structure the store holds, in a stable order.
    fn persisted_structures(&self) -> Result<Vec<PersistedStructure>, io::Error>;

    /// Number of map entries or table rows in `structure`.
    fn structure_len(&self, structure: &PersistedStructure) -> Result<u64, io::Error>;

    /// Key/value pairs of an ordered-map structure, in key order.
    fn map_entries(&self, structure: &PersistedStructure) -> MapEntryIter<'_>;

    /// Raw rows of a table structure, in storage order.
    fn table_rows(&self, structure: &PersistedStructure) -> TableRowIter<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        let index = Index::new(5);

        assert_eq!(Index::new(8), index.plus(3));
        assert_eq!(Index::new(2), index.minus(3));
        assert_eq!(Index::zero(), index.minus(10));
        assert_eq!(Some(Index::zero()), index.checked_minus(5));
        assert_eq!(None, index.checked_minus(6));
        assert!(Index::default().is_zero());
        assert_eq!("5", format!("{:?}", index));
    }
}
