//! A filesystem backed adapter storage.
//!
//! Every adapter is a directory `<root>/<model_id>_adapter_<millis>` which holds the file
//! [`WEIGHTS_FILE`]. The file contains a JSON object which maps parameter names to nested arrays,
//! see [`fedsync_core::weights::conversion`].

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::debug;

use crate::storage::{AdapterRef, AdapterStorage, AdapterStoreError};
use fedsync_core::WeightMap;

/// The name of the weights file inside an adapter directory.
pub const WEIGHTS_FILE: &str = "adapter_weights.json";

const ADAPTER_INFIX: &str = "_adapter_";

#[derive(Debug, Clone)]
pub struct FsAdapterStore {
    root: PathBuf,
}

impl FsAdapterStore {
    /// Creates a store rooted at the given directory. The directory is created on the first
    /// write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, adapter: &AdapterRef) -> Option<PathBuf> {
        let name = adapter.as_str();
        // references are plain directory names
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            None
        } else {
            Some(self.root.join(name))
        }
    }

    /// Finds the newest timestamp among the adapters of the model.
    async fn latest_timestamp(&self, model_id: &str) -> Result<Option<i64>, AdapterStoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut latest = None;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let timestamp = entry
                .file_name()
                .to_str()
                .and_then(|name| parse_timestamp(name, model_id));
            latest = latest.max(timestamp);
        }
        Ok(latest)
    }
}

fn adapter_name(model_id: &str, timestamp: i64) -> AdapterRef {
    AdapterRef::new(format!("{}{}{}", model_id, ADAPTER_INFIX, timestamp))
}

fn parse_timestamp(name: &str, model_id: &str) -> Option<i64> {
    name.strip_prefix(model_id)?
        .strip_prefix(ADAPTER_INFIX)?
        .parse()
        .ok()
}

#[async_trait]
impl AdapterStorage for FsAdapterStore {
    async fn extract(&self, adapter: &AdapterRef) -> Result<WeightMap, AdapterStoreError> {
        let path = self
            .dir(adapter)
            .ok_or_else(|| AdapterStoreError::NotFound(adapter.clone()))?
            .join(WEIGHTS_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(AdapterStoreError::NotFound(adapter.clone()))
            }
            Err(err) => return Err(err.into()),
        };

        let malformed = |reason: String| AdapterStoreError::Malformed {
            adapter: adapter.clone(),
            reason,
        };
        let json = serde_json::from_slice(&bytes).map_err(|err| malformed(err.to_string()))?;
        let weights = WeightMap::from_json(json).map_err(|err| malformed(err.to_string()))?;
        debug!("extracted {} entries from adapter {}", weights.len(), adapter);
        Ok(weights)
    }

    async fn persist(
        &self,
        model_id: &str,
        weights: &WeightMap,
    ) -> Result<AdapterRef, AdapterStoreError> {
        fs::create_dir_all(&self.root).await?;

        // never go back in time, even if the clock does
        let mut timestamp = Utc::now().timestamp_millis();
        if let Some(latest) = self.latest_timestamp(model_id).await? {
            timestamp = timestamp.max(latest + 1);
        }

        let (adapter, dir) = loop {
            let adapter = adapter_name(model_id, timestamp);
            let dir = self
                .dir(&adapter)
                .ok_or_else(|| AdapterStoreError::NotFound(adapter.clone()))?;
            match fs::create_dir(&dir).await {
                Ok(()) => break (adapter, dir),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => timestamp += 1,
                Err(err) => return Err(err.into()),
            }
        };

        let bytes =
            serde_json::to_vec(&weights.to_json()).map_err(|err| AdapterStoreError::Malformed {
                adapter: adapter.clone(),
                reason: err.to_string(),
            })?;
        // write and rename, so that readers never see a partial file
        let partial = dir.join(format!("{}.partial", WEIGHTS_FILE));
        fs::write(&partial, bytes).await?;
        fs::rename(&partial, dir.join(WEIGHTS_FILE)).await?;

        debug!("persisted {} entries as adapter {}", weights.len(), adapter);
        Ok(adapter)
    }

    async fn latest(&self, model_id: &str) -> Result<Option<AdapterRef>, AdapterStoreError> {
        Ok(self
            .latest_timestamp(model_id)
            .await?
            .map(|timestamp| adapter_name(model_id, timestamp)))
    }
}
