mod in_memory;
mod log;

pub use in_memory::InMemoryLogStore;
pub use in_memory::StructureData;
pub use log::Index;
pub use log::LogEntry;
pub use log::LogEntryIter;
pub use log::LogStore;
pub use log::MapEntryIter;
pub use log::PersistedStructure;
pub use log::ReadTransaction;
pub use log::StructureKind;
pub use log::TableRowIter;
pub use log::Term;
