//! Storages for the synchronization and training history.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};
use tracing::debug;

use crate::storage::{HistoryStorage, StorageResult, SyncRecord, TrainingRecord};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct History {
    #[serde(default)]
    sync: Vec<SyncRecord>,
    #[serde(default)]
    training: Vec<TrainingRecord>,
}

/// A history storage which keeps all records in a single JSON file.
///
/// The file is rewritten on every change. Writes of the same store are serialized.
#[derive(Debug, Clone)]
pub struct JsonHistoryStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StorageResult<History> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("malformed history file {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(History::default()),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    async fn store(&self, history: &History) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = self.path.with_extension("partial");
        fs::write(&partial, serde_json::to_vec_pretty(history)?).await?;
        fs::rename(&partial, &self.path)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    async fn update<F>(&self, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut History) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut history = self.load().await?;
        f(&mut history);
        self.store(&history).await
    }
}

#[async_trait]
impl HistoryStorage for JsonHistoryStore {
    async fn add_sync_record(&self, record: SyncRecord) -> StorageResult<()> {
        debug!("adding sync record {}", record.id);
        self.update(|history| history.sync.push(record)).await
    }

    async fn sync_records(&self) -> StorageResult<Vec<SyncRecord>> {
        Ok(self.load().await?.sync)
    }

    async fn add_training_record(&self, record: TrainingRecord) -> StorageResult<()> {
        debug!("adding training record {}", record.id);
        self.update(|history| history.training.push(record)).await
    }

    async fn training_records(&self) -> StorageResult<Vec<TrainingRecord>> {
        Ok(self.load().await?.training)
    }
}

/// A history storage which keeps all records in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryHistory {
    history: Arc<Mutex<History>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStorage for InMemoryHistory {
    async fn add_sync_record(&self, record: SyncRecord) -> StorageResult<()> {
        self.history.lock().await.sync.push(record);
        Ok(())
    }

    async fn sync_records(&self) -> StorageResult<Vec<SyncRecord>> {
        Ok(self.history.lock().await.sync.clone())
    }

    async fn add_training_record(&self, record: TrainingRecord) -> StorageResult<()> {
        self.history.lock().await.training.push(record);
        Ok(())
    }

    async fn training_records(&self) -> StorageResult<Vec<TrainingRecord>> {
        Ok(self.history.lock().await.training.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        storage::{AdapterRef, SyncOutcome},
        tasks::TaskId,
    };
    use fedsync_core::SyncFrequency;

    fn sync_record(outcome: SyncOutcome) -> SyncRecord {
        SyncRecord {
            id: TaskId::new(),
            model_id: "tiny".into(),
            epsilon: 2.,
            delta: 1e-5,
            clip_norm: 1.,
            frequency: SyncFrequency::Daily,
            adapter: AdapterRef::new("tiny_adapter_1"),
            merged_adapter: None,
            completion_time: Utc::now(),
            next_run: None,
            outcome,
            aggregate_received: false,
        }
    }

    fn training_record() -> TrainingRecord {
        TrainingRecord {
            id: TaskId::new(),
            model_id: "tiny".into(),
            epochs: 2,
            batch_size: 4,
            learning_rate: 1e-4,
            num_examples: 3,
            adapter: AdapterRef::new("tiny_adapter_2"),
            final_loss: 0.42,
            completion_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_json_history_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("history.json");
        let store = JsonHistoryStore::new(&path);
        assert!(store.sync_records().await.unwrap().is_empty());
        assert!(store.training_records().await.unwrap().is_empty());

        let completed = sync_record(SyncOutcome::Completed);
        let failed = sync_record(SyncOutcome::Failed {
            error: "remote exchange failed".into(),
        });
        let training = training_record();
        store.add_sync_record(completed.clone()).await.unwrap();
        store.add_sync_record(failed.clone()).await.unwrap();
        store.add_training_record(training.clone()).await.unwrap();

        // a fresh store reads what the first one wrote
        let reopened = JsonHistoryStore::new(&path);
        assert_eq!(reopened.sync_records().await.unwrap(), vec![completed, failed]);
        assert_eq!(reopened.training_records().await.unwrap(), vec![training]);
    }

    #[tokio::test]
    async fn test_json_history_store_concurrent_writes() {
        let dir = tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("history.json"));

        let writes = (0..10).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .add_sync_record(sync_record(SyncOutcome::Completed))
                    .await
            })
        });
        for write in futures::future::join_all(writes).await {
            write.unwrap().unwrap();
        }
        assert_eq!(store.sync_records().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_json_history_store_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(JsonHistoryStore::new(&path).sync_records().await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_history() {
        let history = InMemoryHistory::new();
        let record = sync_record(SyncOutcome::Completed);
        history.add_sync_record(record.clone()).await.unwrap();
        history.add_training_record(training_record()).await.unwrap();

        assert_eq!(history.clone().sync_records().await.unwrap(), vec![record]);
        assert_eq!(history.training_records().await.unwrap().len(), 1);
    }
}
