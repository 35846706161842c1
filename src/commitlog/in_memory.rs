use crate::commitlog::{
    Index, LogEntry, LogEntryIter, LogStore, MapEntryIter, PersistedStructure, ReadTransaction, StructureKind,
    TableRowIter, Term,
};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, RwLock};

/// Contents of one persisted structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructureData {
    OrderedMap(BTreeMap<Bytes, Bytes>),
    Table(Vec<Bytes>),
}

impl StructureData {
    fn kind(&self) -> StructureKind {
        match self {
            StructureData::OrderedMap(_) => StructureKind::OrderedMap,
            StructureData::Table(_) => StructureKind::Table,
        }
    }

    fn len(&self) -> usize {
        match self {
            StructureData::OrderedMap(map) => map.len(),
            StructureData::Table(rows) => rows.len(),
        }
    }
}

// I am focusing on the replication protocol, not on how to persist the data durably. This models
// a storage engine with MVCC reads: writers copy-on-write the state, and a read transaction just
// holds on to the version it started with.
#[derive(Default)]
pub struct InMemoryLogStore {
    state: RwLock<Arc<StoreState>>,
}

#[derive(Clone, Default)]
struct StoreState {
    entries: VecDeque<LogEntry>,
    // Index and term of the last entry that was compacted away.
    compacted_index: Index,
    compacted_term: Term,
    committed_index: Index,
    structures: BTreeMap<Bytes, StructureData>,
}

impl StoreState {
    fn first_entry_index(&self) -> Index {
        self.compacted_index.plus(1)
    }

    fn last_entry_index(&self) -> Index {
        self.compacted_index.plus(self.entries.len() as u64)
    }

    fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.compacted_term)
    }

    fn entry(&self, index: Index) -> Option<&LogEntry> {
        if index <= self.compacted_index {
            return None;
        }
        let offset = (index.as_u64() - self.first_entry_index().as_u64()) as usize;
        self.entries.get(offset)
    }

    fn term_at(&self, index: Index) -> Option<Term> {
        if index.is_zero() {
            Some(Term::default())
        } else if index == self.compacted_index {
            Some(self.compacted_term)
        } else {
            self.entry(index).map(|e| e.term)
        }
    }
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Arc<StoreState> {
        self.state.read().expect("InMemoryLogStore state lock poison").clone()
    }

    fn write<R>(&self, mutate: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut guard = self.state.write().expect("InMemoryLogStore state lock poison");
        mutate(Arc::make_mut(&mut guard))
    }

    /// Append a new entry at the end of the log and return its index.
    pub fn append(&self, term: Term, data: Bytes) -> Index {
        self.write(|state| {
            let index = state.last_entry_index().plus(1);
            state.entries.push_back(LogEntry {
                index,
                term,
                data,
                flags: 0,
            });
            index
        })
    }

    /// Append an entry replicated from elsewhere. It must directly follow the current last entry.
    pub fn append_entry(&self, entry: LogEntry) -> Result<(), io::Error> {
        self.write(|state| {
            let expected = state.last_entry_index().plus(1);
            if entry.index != expected {
                return Err(invalid_input(format!(
                    "Entry index {:?} does not follow last index {:?}",
                    entry.index,
                    state.last_entry_index()
                )));
            }
            if entry.term < state.last_term() {
                return Err(invalid_input(format!(
                    "Entry term {:?} is older than last term {:?}",
                    entry.term,
                    state.last_term()
                )));
            }
            state.entries.push_back(entry);
            Ok(())
        })
    }

    /// Delete `index` and everything after it. Committed entries can never be deleted.
    pub fn truncate_from(&self, index: Index) -> Result<(), io::Error> {
        self.write(|state| {
            if index <= state.committed_index {
                return Err(invalid_input(format!(
                    "Refusing to truncate from {:?}, entries up to {:?} are committed",
                    index, state.committed_index
                )));
            }
            if index <= state.last_entry_index() {
                let keep = (index.as_u64() - state.first_entry_index().as_u64()) as usize;
                state.entries.truncate(keep);
            }
            Ok(())
        })
    }

    /// Drop every entry before `index`. Only committed entries can be compacted.
    pub fn compact_before(&self, index: Index) -> Result<(), io::Error> {
        self.write(|state| {
            let new_compacted = index.minus(1);
            if new_compacted > state.committed_index {
                return Err(invalid_input(format!(
                    "Refusing to compact through {:?}, only {:?} is committed",
                    new_compacted, state.committed_index
                )));
            }
            if new_compacted <= state.compacted_index {
                return Ok(());
            }
            let compacted_term = state.term_at(new_compacted).unwrap_or(state.compacted_term);
            let drop = (new_compacted.as_u64() - state.compacted_index.as_u64()) as usize;
            state.entries.drain(..drop);
            state.compacted_index = new_compacted;
            state.compacted_term = compacted_term;
            Ok(())
        })
    }

    /// Replace the whole store with state received from a leader. The log restarts right after
    /// `last_included_index`, which is considered committed.
    pub fn install_snapshot(
        &self,
        last_included_index: Index,
        last_included_term: Term,
        structures: BTreeMap<Bytes, StructureData>,
    ) {
        self.write(|state| {
            state.entries.clear();
            state.compacted_index = last_included_index;
            state.compacted_term = last_included_term;
            state.committed_index = last_included_index;
            state.structures = structures;
        })
    }

    pub fn put_map_entry(&self, structure: Bytes, key: Bytes, value: Bytes) {
        self.write(|state| {
            let data = state
                .structures
                .entry(structure)
                .or_insert_with(|| StructureData::OrderedMap(BTreeMap::new()));
            if let StructureData::OrderedMap(map) = data {
                map.insert(key, value);
            }
        })
    }

    pub fn push_table_row(&self, structure: Bytes, row: Bytes) {
        self.write(|state| {
            let data = state
                .structures
                .entry(structure)
                .or_insert_with(|| StructureData::Table(Vec::new()));
            if let StructureData::Table(rows) = data {
                rows.push(row);
            }
        })
    }

    pub fn structures(&self) -> BTreeMap<Bytes, StructureData> {
        self.read().structures.clone()
    }

    /// Every retained entry, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.read().entries.iter().cloned().collect()
    }

    pub fn term_at(&self, index: Index) -> Option<Term> {
        self.read().term_at(index)
    }

    pub fn first_entry_index(&self) -> Index {
        self.read().first_entry_index()
    }

    pub fn last_entry_index(&self) -> Index {
        self.read().last_entry_index()
    }

    pub fn committed_index(&self) -> Index {
        self.read().committed_index
    }
}

impl LogStore for InMemoryLogStore {
    fn read_transaction(&self) -> Result<Box<dyn ReadTransaction>, io::Error> {
        Ok(Box::new(InMemoryReadTransaction { state: self.read() }))
    }

    fn set_committed_index(&self, index: Index) -> Result<(), io::Error> {
        self.write(|state| {
            if index > state.last_entry_index() {
                return Err(invalid_input(format!(
                    "Cannot commit {:?} past last index {:?}",
                    index,
                    state.last_entry_index()
                )));
            }
            if index > state.committed_index {
                state.committed_index = index;
            }
            Ok(())
        })
    }
}

struct InMemoryReadTransaction {
    state: Arc<StoreState>,
}

impl InMemoryReadTransaction {
    fn structure(&self, structure: &PersistedStructure) -> Result<&StructureData, io::Error> {
        match self.state.structures.get(&structure.key) {
            Some(data) if data.kind() == structure.kind => Ok(data),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No {:?} structure with key {:?}", structure.kind, structure.key),
            )),
        }
    }
}

impl ReadTransaction for InMemoryReadTransaction {
    fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        Ok(self.state.term_at(index))
    }

    fn first_entry_index(&self) -> Index {
        self.state.first_entry_index()
    }

    fn last_entry_index(&self) -> Index {
        self.state.last_entry_index()
    }

    fn committed_index(&self) -> Index {
        self.state.committed_index
    }

    fn entries_from(&self, index: Index) -> LogEntryIter<'_> {
        let skip = index.as_u64().saturating_sub(self.state.first_entry_index().as_u64()) as usize;
        Box::new(self.state.entries.iter().skip(skip).cloned().map(Ok))
    }

    fn persisted_structures(&self) -> Result<Vec<PersistedStructure>, io::Error> {
        Ok(self
            .state
            .structures
            .iter()
            .map(|(key, data)| PersistedStructure {
                kind: data.kind(),
                key: key.clone(),
            })
            .collect())
    }

    fn structure_len(&self, structure: &PersistedStructure) -> Result<u64, io::Error> {
        self.structure(structure).map(|data| data.len() as u64)
    }

    fn map_entries(&self, structure: &PersistedStructure) -> MapEntryIter<'_> {
        match self.structure(structure) {
            Ok(StructureData::OrderedMap(map)) => Box::new(map.iter().map(|(k, v)| Ok((k.clone(), v.clone())))),
            Ok(StructureData::Table(_)) => Box::new(std::iter::empty()),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn table_rows(&self, structure: &PersistedStructure) -> TableRowIter<'_> {
        match self.structure(structure) {
            Ok(StructureData::Table(rows)) => Box::new(rows.iter().cloned().map(Ok)),
            Ok(StructureData::OrderedMap(_)) => Box::new(std::iter::empty()),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}
