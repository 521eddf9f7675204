use std::sync::PoisonError;

use chrono::{DateTime, Utc};
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    aggregator::AggregatorError,
    orchestrator::{Orchestrator, StartError},
    runtime::RuntimeError,
    storage::{AdapterRef, AdapterStoreError, StorageError, SyncOutcome, SyncRecord},
    tasks::{TaskError, TaskHandle, TaskId, TaskKind},
};
use fedsync_core::{
    merge,
    next_run,
    PrivacyBudget,
    PrivacyError,
    SyncFrequency,
};

/// A request to synchronize the adapter of the active model.
///
/// Missing privacy parameters are taken from the configured defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub epsilon: Option<f64>,
    pub delta: Option<f64>,
    pub clip_norm: Option<f64>,
    #[serde(default)]
    pub frequency: SyncFrequency,
}

impl SyncRequest {
    fn budget(&self, defaults: &PrivacyBudget) -> Result<PrivacyBudget, PrivacyError> {
        PrivacyBudget::new(
            self.epsilon.unwrap_or(defaults.epsilon),
            self.delta.unwrap_or(defaults.delta),
            self.clip_norm.unwrap_or(defaults.clip_norm),
        )
    }
}

#[derive(Debug, Display, Error)]
/// Errors of a synchronization task.
pub enum SyncError {
    /// no adapter found for model {0}
    NoAdapterFound(String),
    /// {0}
    Adapter(#[from] AdapterStoreError),
    /// {0}
    Privacy(#[from] PrivacyError),
    /// remote exchange failed: {0}
    RemoteExchange(#[from] AggregatorError),
    /// failed to write the sync history: {0}
    History(StorageError),
    /// {0}
    Runtime(#[from] RuntimeError),
    /// {0}
    Task(#[from] TaskError),
}

impl Orchestrator {
    /// Starts a synchronization of the adapter of the active model and returns the task id.
    ///
    /// # Errors
    /// Fails without creating a task if the privacy parameters are invalid, if no model is loaded
    /// or if the model is busy with another task or a download.
    pub fn start_sync(&self, request: SyncRequest) -> Result<TaskId, StartError> {
        let budget = request.budget(&self.default_budget)?;
        let model_id = self.active_model_id()?;
        let guard = self.reserve(&model_id)?;

        let job = SyncJob {
            orchestrator: self.clone(),
            model_id,
            budget,
            frequency: request.frequency,
        };
        let task = self
            .tracker
            .spawn_holding(TaskKind::Sync, guard, move |handle| job.run(handle));
        info!("scheduled sync task {}", task.id);
        Ok(task.id)
    }
}

/// What a synchronization achieved before it ended.
#[derive(Debug, Default)]
struct Released {
    aggregate_received: bool,
    merged_adapter: Option<AdapterRef>,
    completion_time: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

struct SyncJob {
    orchestrator: Orchestrator,
    model_id: String,
    budget: PrivacyBudget,
    frequency: SyncFrequency,
}

impl SyncJob {
    async fn run(self, handle: TaskHandle) -> Result<(), SyncError> {
        let adapter = self
            .orchestrator
            .adapters
            .latest(&self.model_id)
            .await?
            .ok_or_else(|| SyncError::NoAdapterFound(self.model_id.clone()))?;

        let mut released = Released::default();
        let result = self.release(&handle, &adapter, &mut released).await;
        let outcome = match &result {
            Ok(()) => SyncOutcome::Completed,
            Err(err) => SyncOutcome::Failed {
                error: err.to_string(),
            },
        };
        let record = SyncRecord {
            id: handle.id(),
            model_id: self.model_id.clone(),
            epsilon: self.budget.epsilon,
            delta: self.budget.delta,
            clip_norm: self.budget.clip_norm,
            frequency: self.frequency,
            adapter,
            merged_adapter: released.merged_adapter,
            completion_time: released.completion_time.unwrap_or_else(Utc::now),
            next_run: released.next_run,
            outcome,
            aggregate_received: released.aggregate_received,
        };
        let recorded = self.orchestrator.history.add_sync_record(record).await;

        match (result, recorded) {
            (Ok(()), recorded) => recorded.map_err(SyncError::History),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(history_err)) => {
                error!("failed to record the failed sync: {:#}", history_err);
                Err(err)
            }
        }
    }

    /// Privatizes the adapter, exchanges it with the aggregator and merges the aggregate.
    async fn release(
        &self,
        handle: &TaskHandle,
        adapter: &AdapterRef,
        released: &mut Released,
    ) -> Result<(), SyncError> {
        let orchestrator = &self.orchestrator;

        let local = orchestrator.adapters.extract(adapter).await?;
        handle.report_progress(20)?;

        let privatized = {
            let mut engine = orchestrator
                .privacy
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            engine.privatize_with_budget(local.clone(), &self.budget)?
        };
        handle.report_progress(40)?;

        let response = orchestrator
            .aggregator
            .exchange(&privatized, &self.budget)
            .await?;
        handle.report_progress(60)?;

        if let Some(aggregate) = response.aggregate {
            released.aggregate_received = true;
            let outcome = merge(local, &aggregate);
            if !outcome.is_clean() {
                warn!(
                    "retained {} local tensors with mismatching shapes",
                    outcome.mismatches.len()
                );
            }
            let merged_adapter = orchestrator
                .adapters
                .persist(&self.model_id, &outcome.merged)
                .await?;
            released.merged_adapter = Some(merged_adapter.clone());
            orchestrator.runtime.apply_adapter(&outcome.merged).await?;
            info!("merged the aggregate into {}", merged_adapter);
        } else {
            info!("no aggregate received, nothing to merge");
        }
        handle.report_progress(80)?;

        let completion_time = Utc::now();
        released.completion_time = Some(completion_time);
        released.next_run = next_run(self.frequency, Some(completion_time));
        handle.report_progress(100)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_budget_defaults() {
        let defaults = PrivacyBudget::new(2., 1e-5, 1.).unwrap();
        let request = SyncRequest {
            epsilon: Some(4.),
            ..SyncRequest::default()
        };
        assert_eq!(
            request.budget(&defaults).unwrap(),
            PrivacyBudget::new(4., 1e-5, 1.).unwrap()
        );

        let request = SyncRequest {
            delta: Some(1.),
            ..SyncRequest::default()
        };
        assert!(request.budget(&defaults).is_err());
    }

    #[test]
    fn test_request_deserialization() {
        let request: SyncRequest =
            serde_json::from_str(r#"{"epsilon": 1.5, "frequency": "weekly"}"#).unwrap();
        assert_eq!(request.epsilon, Some(1.5));
        assert_eq!(request.clip_norm, None);
        assert_eq!(request.frequency, SyncFrequency::Weekly);
    }
}
