//! The orchestration of downloads, training runs and adapter synchronizations.
//!
//! The [`Orchestrator`] is the entry point for every long running operation. Starting an
//! operation validates the request, creates a task in the [`TaskTracker`] and returns its id right
//! away. The work itself runs in the background and reports its progress to the tracker.
//!
//! Synchronization and training tasks operate on the adapter of the active model. At most one of
//! them runs per model at any time, a concurrent start fails with [`StartError::ModelBusy`].
//! A download replaces the active model once it is finished, so it can't run alongside a
//! synchronization or training task either. Downloads don't exclude each other.

mod download;
mod sync;
mod training;

#[cfg(test)]
pub(crate) mod tests;

pub use self::{
    download::DownloadError,
    sync::{SyncError, SyncRequest},
    training::{TrainingError, TrainingRequest},
};

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    aggregator::Aggregator,
    runtime::{ModelInfo, ModelRuntime},
    storage::{AdapterStorage, HistoryStorage, StorageResult},
    tasks::{Task, TaskError, TaskId, TaskKind, TaskTracker},
};
use fedsync_core::{PrivacyBudget, PrivacyEngine, PrivacyError, SchedulePolicy};

#[derive(Debug, Display, Error)]
/// Errors which prevent a task from being started.
pub enum StartError {
    /// {0}
    InvalidParameter(#[from] PrivacyError),
    /// no model is loaded
    NoModelLoaded,
    /// model {0} is busy with another task
    ModelBusy(String),
    /// invalid request: {0}
    InvalidRequest(String),
}

/// A summary of the synchronization history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// The completion time of the latest synchronization, successful or not.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Whether the latest synchronization succeeded.
    pub sync_successful: bool,
    /// The number of successful synchronizations.
    pub updates_sent: u64,
    /// The number of synchronizations which received an aggregate.
    pub aggregates_received: u64,
}

/// A summary of the training history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub total_training_sessions: u64,
    pub last_training_time: Option<DateTime<Utc>>,
    pub last_loss: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub is_loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_info: Option<ModelInfo>,
}

/// Starts and observes background tasks.
///
/// The orchestrator is cheap to clone. All clones share the same task registry, collaborators
/// and model locks.
#[derive(Clone)]
pub struct Orchestrator {
    tracker: TaskTracker,
    adapters: Arc<dyn AdapterStorage>,
    history: Arc<dyn HistoryStorage>,
    runtime: Arc<dyn ModelRuntime>,
    aggregator: Arc<dyn Aggregator>,
    privacy: Arc<Mutex<PrivacyEngine>>,
    /// Fills the privacy parameters a sync request leaves out.
    default_budget: PrivacyBudget,
    busy: Arc<Mutex<Reservations>>,
}

/// The running tasks which depend on the active model.
#[derive(Debug, Default)]
struct Reservations {
    /// The models with a running synchronization or training task.
    models: HashSet<String>,
    /// The number of running downloads.
    downloads: usize,
}

impl Orchestrator {
    pub fn new(
        adapters: Arc<dyn AdapterStorage>,
        history: Arc<dyn HistoryStorage>,
        runtime: Arc<dyn ModelRuntime>,
        aggregator: Arc<dyn Aggregator>,
        default_budget: PrivacyBudget,
    ) -> Self {
        Self {
            tracker: TaskTracker::new(),
            adapters,
            history,
            runtime,
            aggregator,
            privacy: Arc::new(Mutex::new(PrivacyEngine::new())),
            default_budget,
            busy: Arc::new(Mutex::new(Reservations::default())),
        }
    }

    /// Replaces the privacy engine, e.g. with a seeded one.
    pub fn with_privacy_engine(self, engine: PrivacyEngine) -> Self {
        Self {
            privacy: Arc::new(Mutex::new(engine)),
            ..self
        }
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn default_budget(&self) -> PrivacyBudget {
        self.default_budget
    }

    /// Gets a snapshot of a task of the given kind.
    ///
    /// # Errors
    /// Fails with [`TaskError::NotFound`] if the task doesn't exist or is of another kind.
    pub fn task(&self, id: TaskId, kind: TaskKind) -> Result<Task, TaskError> {
        let task = self.tracker.query(id)?;
        if task.kind == kind {
            Ok(task)
        } else {
            Err(TaskError::NotFound(id))
        }
    }

    /// Gets the synchronization schedule, anchored at the latest successful synchronization.
    pub async fn schedule(&self) -> StorageResult<SchedulePolicy> {
        let records = self.history.sync_records().await?;
        Ok(records
            .iter()
            .rev()
            .find(|record| record.outcome.is_completed())
            .map(|record| {
                SchedulePolicy::from_last_run(record.frequency, Some(record.completion_time))
            })
            .unwrap_or_default())
    }

    pub async fn sync_status(&self) -> StorageResult<SyncStatus> {
        let records = self.history.sync_records().await?;
        let latest = records.last();
        Ok(SyncStatus {
            last_sync_time: latest.map(|record| record.completion_time),
            sync_successful: latest.map_or(false, |record| record.outcome.is_completed()),
            updates_sent: records
                .iter()
                .filter(|record| record.outcome.is_completed())
                .count() as u64,
            aggregates_received: records
                .iter()
                .filter(|record| record.aggregate_received)
                .count() as u64,
        })
    }

    pub async fn training_stats(&self) -> StorageResult<TrainingStats> {
        let records = self.history.training_records().await?;
        let latest = records.last();
        Ok(TrainingStats {
            total_training_sessions: records.len() as u64,
            last_training_time: latest.map(|record| record.completion_time),
            last_loss: latest.map(|record| record.final_loss),
        })
    }

    pub fn model_status(&self) -> ModelStatus {
        let model_info = self.runtime.active_model();
        ModelStatus {
            is_loaded: model_info.is_some(),
            model_info,
        }
    }

    fn active_model_id(&self) -> Result<String, StartError> {
        self.runtime
            .active_model()
            .map(|info| info.model_id)
            .ok_or(StartError::NoModelLoaded)
    }

    /// Reserves the model for a synchronization or training task.
    ///
    /// # Errors
    /// Fails if the model is reserved already or if a download is running.
    fn reserve(&self, model_id: &str) -> Result<ModelGuard, StartError> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if busy.downloads > 0 || !busy.models.insert(model_id.to_string()) {
            return Err(StartError::ModelBusy(model_id.to_string()));
        }
        debug!("reserved model {}", model_id);
        Ok(ModelGuard {
            reservation: Reservation::Model(model_id.to_string()),
            busy: self.busy.clone(),
        })
    }

    /// Reserves the runtime for a download.
    ///
    /// # Errors
    /// Fails if any model is reserved for a synchronization or training task.
    fn reserve_download(&self) -> Result<ModelGuard, StartError> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model_id) = busy.models.iter().next() {
            return Err(StartError::ModelBusy(model_id.clone()));
        }
        busy.downloads += 1;
        Ok(ModelGuard {
            reservation: Reservation::Download,
            busy: self.busy.clone(),
        })
    }
}

#[derive(Debug)]
enum Reservation {
    Model(String),
    Download,
}

/// Releases a reservation when dropped.
struct ModelGuard {
    reservation: Reservation,
    busy: Arc<Mutex<Reservations>>,
}

impl Drop for ModelGuard {
    fn drop(&mut self) {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        match &self.reservation {
            Reservation::Model(model_id) => {
                busy.models.remove(model_id);
                debug!("released model {}", model_id);
            }
            Reservation::Download => busy.downloads = busy.downloads.saturating_sub(1),
        }
    }
}
