use displaydoc::Display;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    orchestrator::{Orchestrator, StartError},
    runtime::RuntimeError,
    tasks::{TaskError, TaskHandle, TaskId, TaskKind},
};

/// The share of the progress which is reserved for the download itself. The rest covers loading
/// the model.
const DOWNLOAD_SHARE: u16 = 90;

#[derive(Debug, Display, Error)]
/// Errors of a download task.
pub enum DownloadError {
    /// {0}
    Runtime(#[from] RuntimeError),
    /// {0}
    Task(#[from] TaskError),
}

impl Orchestrator {
    /// Starts downloading a model and returns the task id. The model becomes the active model once
    /// the download is finished.
    ///
    /// Downloads don't need an active model and are not serialized with each other.
    ///
    /// # Errors
    /// Fails without creating a task if the model id is blank or if a synchronization or training
    /// task is running.
    pub fn start_download(&self, model_id: impl Into<String>) -> Result<TaskId, StartError> {
        let model_id = model_id.into();
        if model_id.trim().is_empty() {
            return Err(StartError::InvalidRequest(
                "model_id must not be empty".into(),
            ));
        }
        let guard = self.reserve_download()?;

        let orchestrator = self.clone();
        let task = self
            .tracker
            .spawn_holding(TaskKind::Download, guard, move |handle| {
                orchestrator.download(handle, model_id)
            });
        info!("scheduled download task {}", task.id);
        Ok(task.id)
    }

    async fn download(self, handle: TaskHandle, model_id: String) -> Result<(), DownloadError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let forward = async {
            let mut reported = 0;
            while let Some(percent) = rx.recv().await {
                let scaled = (u16::from(percent.min(100)) * DOWNLOAD_SHARE / 100) as u8;
                if scaled > reported {
                    handle.report_progress(scaled)?;
                    reported = scaled;
                }
            }
            Ok::<_, TaskError>(())
        };
        let (downloaded, forwarded) = tokio::join!(self.runtime.download(&model_id, tx), forward);
        downloaded?;
        forwarded?;

        let info = self.runtime.load(&model_id).await?;
        handle.report_progress(95)?;
        info!("model {} is active since {}", info.model_id, info.loaded_at);
        Ok(())
    }
}
