use chrono::Utc;
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    orchestrator::{Orchestrator, StartError},
    runtime::{RuntimeError, TrainingExample, TrainingSettings},
    storage::{AdapterStoreError, StorageError, TrainingRecord},
    tasks::{TaskError, TaskHandle, TaskId, TaskKind},
};

/// A request to train the adapter of the active model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub examples: Vec<TrainingExample>,
    #[serde(default)]
    pub settings: TrainingSettings,
}

impl TrainingRequest {
    fn validate(&self) -> Result<(), StartError> {
        let settings = &self.settings;
        if settings.num_epochs == 0 {
            return Err(StartError::InvalidRequest(
                "num_epochs must be at least 1".into(),
            ));
        }
        if settings.batch_size == 0 {
            return Err(StartError::InvalidRequest(
                "batch_size must be at least 1".into(),
            ));
        }
        if !settings.learning_rate.is_finite() || settings.learning_rate <= 0. {
            return Err(StartError::InvalidRequest(format!(
                "learning_rate must be positive, got {}",
                settings.learning_rate
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Display, Error)]
/// Errors of a training task.
pub enum TrainingError {
    /// no training data available
    NoTrainingData,
    /// {0}
    Runtime(#[from] RuntimeError),
    /// {0}
    Adapter(#[from] AdapterStoreError),
    /// failed to write the training history: {0}
    History(StorageError),
    /// {0}
    Task(#[from] TaskError),
}

impl Orchestrator {
    /// Starts a training run of the adapter of the active model and returns the task id.
    ///
    /// # Errors
    /// Fails without creating a task if the settings are invalid, if no model is loaded or if the
    /// model is busy with another task or a download. An empty training set only fails the task.
    pub fn start_training(&self, request: TrainingRequest) -> Result<TaskId, StartError> {
        request.validate()?;
        let model_id = self.active_model_id()?;
        let guard = self.reserve(&model_id)?;

        let orchestrator = self.clone();
        let task = self
            .tracker
            .spawn_holding(TaskKind::Training, guard, move |handle| {
                orchestrator.train(handle, model_id, request)
            });
        info!("scheduled training task {}", task.id);
        Ok(task.id)
    }

    async fn train(
        self,
        handle: TaskHandle,
        model_id: String,
        request: TrainingRequest,
    ) -> Result<(), TrainingError> {
        let TrainingRequest { examples, settings } = request;
        if examples.is_empty() {
            return Err(TrainingError::NoTrainingData);
        }

        let mut final_loss = 0.;
        for epoch in 0..settings.num_epochs {
            let progress = u64::from(epoch) * 100 / u64::from(settings.num_epochs);
            handle.report_progress(progress as u8)?;
            let stats = self.runtime.train_epoch(&examples, &settings, epoch).await?;
            debug!("epoch {} finished with loss {:.4}", stats.epoch, stats.loss);
            final_loss = stats.loss;
        }

        let weights = self.runtime.adapter_weights().await?;
        let adapter = self.adapters.persist(&model_id, &weights).await?;
        info!("persisted trained adapter {}", adapter);

        let record = TrainingRecord {
            id: handle.id(),
            model_id,
            epochs: settings.num_epochs,
            batch_size: settings.batch_size,
            learning_rate: settings.learning_rate,
            num_examples: examples.len(),
            adapter,
            final_loss,
            completion_time: Utc::now(),
        };
        self.history
            .add_training_record(record)
            .await
            .map_err(TrainingError::History)
    }
}
