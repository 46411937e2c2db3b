//! Port allocation and sticky persistence for database engine instances.

mod allocator;
mod persistence;

pub use allocator::PortAllocator;
pub use persistence::{load_persisted_pair, persist_pair, PersistedPorts};
