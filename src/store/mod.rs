//! Entry storage: the in-memory store, its metrics and clocks, and optional
//! persistent backends.

pub mod entry_store;
pub mod persist;
pub mod traits;

pub use entry_store::{Entry, EntryInfo, EntryMeta, EntryStore, Generation};
pub use persist::{DiskBackend, MemoryBackend, PERSIST_FORMAT, PersistBackend, PersistedEntry};
pub use traits::{Clock, ManualClock, StoreMetrics, SweepReport, SystemClock};
