//! The model runtime.
//!
//! The runtime owns the language model and its adapter. The synchronization pipeline only needs a
//! narrow view on it: which model is active, downloading and loading a model, running a training
//! epoch and reading or replacing the adapter weights. This view is the [`ModelRuntime`] trait.

pub mod simulated;

pub use self::simulated::SimulatedRuntime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use fedsync_core::WeightMap;

/// A single supervised example of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub input: String,
    pub output: String,
}

/// Hyperparameters of a training run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub num_epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 1,
            batch_size: 4,
            learning_rate: 1e-4,
        }
    }
}

/// Information about the active model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub loaded_at: DateTime<Utc>,
}

/// The result of a single training epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochStats {
    pub epoch: u32,
    pub loss: f64,
}

#[derive(Debug, Display, Error)]
/// Errors of the model runtime.
pub enum RuntimeError {
    /// no model is loaded
    NoModelLoaded,
    /// model {0} is not available
    UnknownModel(String),
    /// training failed: {0}
    Training(String),
    /// model storage failed: {0}
    Io(#[from] std::io::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelRuntime: Send + Sync + 'static {
    /// Gets the active model, if any.
    fn active_model(&self) -> Option<ModelInfo>;

    /// Downloads a model. The download progress in percent is sent to `progress`.
    async fn download(
        &self,
        model_id: &str,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<(), RuntimeError>;

    /// Loads a downloaded model and makes it the active one.
    async fn load(&self, model_id: &str) -> Result<ModelInfo, RuntimeError>;

    /// Runs one training epoch of the active model's adapter.
    async fn train_epoch(
        &self,
        examples: &[TrainingExample],
        settings: &TrainingSettings,
        epoch: u32,
    ) -> Result<EpochStats, RuntimeError>;

    /// Reads the adapter weights of the active model.
    async fn adapter_weights(&self) -> Result<WeightMap, RuntimeError>;

    /// Replaces the adapter weights of the active model.
    async fn apply_adapter(&self, weights: &WeightMap) -> Result<(), RuntimeError>;
}
