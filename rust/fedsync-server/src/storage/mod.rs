//! Storage backends.
//!
//! Adapters are stored via the [`AdapterStorage`] trait, the synchronization and training history
//! via the [`HistoryStorage`] trait. Both traits are object safe, the rest of the crate only
//! deals with `Arc<dyn ...>` storages.

pub mod fs;
pub mod history;
pub mod traits;

pub use self::{
    fs::FsAdapterStore,
    history::{InMemoryHistory, JsonHistoryStore},
    traits::{
        AdapterRef,
        AdapterStorage,
        AdapterStoreError,
        HistoryStorage,
        StorageError,
        StorageResult,
        SyncOutcome,
        SyncRecord,
        TrainingRecord,
    },
};
