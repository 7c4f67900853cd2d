//! Persistence layer modules.

pub mod debounce;
pub mod snapshot;
pub mod store;

pub use debounce::{spawn_persister, PersistHandle, PersistRequests, SnapshotSource};
pub use snapshot::PersistedSnapshot;
pub use store::{FileSnapshotStore, SnapshotStore};
