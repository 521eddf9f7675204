//! Storage API.

use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{AsRef, Display, From, Into};
use displaydoc::Display as DisplayDoc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::TaskId;
use fedsync_core::{SyncFrequency, WeightMap};

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// A reference to a persisted adapter.
///
/// References have the form `<model_id>_adapter_<timestamp>`, where the timestamp is given in
/// milliseconds since the unix epoch. A newer adapter of a model always has a larger timestamp.
#[derive(AsRef, Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterRef(String);

impl AdapterRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, DisplayDoc, Error)]
/// Errors of the adapter storage.
pub enum AdapterStoreError {
    /// adapter {0} not found
    NotFound(AdapterRef),
    /// malformed adapter {adapter}: {reason}
    Malformed { adapter: AdapterRef, reason: String },
    /// adapter storage I/O failed: {0}
    Io(#[from] io::Error),
}

#[async_trait]
/// An abstract adapter storage.
///
/// Every persisted adapter gets a new reference. Existing adapters are never overwritten, so a
/// reference always resolves to the same weights.
pub trait AdapterStorage: Send + Sync + 'static {
    /// Reads the weights of an adapter.
    ///
    /// # Behavior
    ///
    /// - If the adapter doesn't exist, return [`AdapterStoreError::NotFound`].
    /// - If the adapter can't be decoded, return [`AdapterStoreError::Malformed`].
    async fn extract(&self, adapter: &AdapterRef) -> Result<WeightMap, AdapterStoreError>;

    /// Writes the weights as a new adapter of the given model and returns its reference.
    async fn persist(
        &self,
        model_id: &str,
        weights: &WeightMap,
    ) -> Result<AdapterRef, AdapterStoreError>;

    /// Gets the most recently persisted adapter of the given model.
    ///
    /// # Behavior
    ///
    /// - If the model has no adapter, return `Ok(None)`.
    async fn latest(&self, model_id: &str) -> Result<Option<AdapterRef>, AdapterStoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
/// How a synchronization ended.
pub enum SyncOutcome {
    Completed,
    Failed { error: String },
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// A history entry which is written when a synchronization task terminates.
pub struct SyncRecord {
    /// The id of the synchronization task.
    pub id: TaskId,
    pub model_id: String,
    pub epsilon: f64,
    pub delta: f64,
    pub clip_norm: f64,
    pub frequency: SyncFrequency,
    /// The adapter which was released.
    pub adapter: AdapterRef,
    /// The adapter holding the merged aggregate, if an aggregate was merged.
    pub merged_adapter: Option<AdapterRef>,
    pub completion_time: DateTime<Utc>,
    pub next_run: Option<DateTime<Utc>>,
    pub outcome: SyncOutcome,
    pub aggregate_received: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// A history entry which is written when a training task completes.
pub struct TrainingRecord {
    /// The id of the training task.
    pub id: TaskId,
    pub model_id: String,
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    pub num_examples: usize,
    /// The adapter which holds the trained weights.
    pub adapter: AdapterRef,
    pub final_loss: f64,
    pub completion_time: DateTime<Utc>,
}

#[async_trait]
/// An abstract storage for the synchronization and training history.
pub trait HistoryStorage: Send + Sync + 'static {
    /// Appends a synchronization record.
    async fn add_sync_record(&self, record: SyncRecord) -> StorageResult<()>;

    /// Returns all synchronization records in the order they were added.
    async fn sync_records(&self) -> StorageResult<Vec<SyncRecord>>;

    /// Appends a training record.
    async fn add_training_record(&self, record: TrainingRecord) -> StorageResult<()>;

    /// Returns all training records in the order they were added.
    async fn training_records(&self) -> StorageResult<Vec<TrainingRecord>>;
}
