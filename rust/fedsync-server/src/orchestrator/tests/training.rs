use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tempfile::tempdir;

use crate::{
    aggregator::SimulatedAggregator,
    orchestrator::{
        tests::utils::{default_budget, examples, FixtureBuilder, MODEL},
        Orchestrator,
        StartError,
        SyncRequest,
        TrainingRequest,
    },
    runtime::{MockModelRuntime, ModelInfo, ModelRuntime, RuntimeError, TrainingSettings},
    storage::{AdapterStorage, FsAdapterStore, HistoryStorage, InMemoryHistory},
    tasks::{TaskKind, TaskStatus},
};

#[tokio::test]
async fn test_training_persists_adapter() {
    let fixture = FixtureBuilder::new().build().await;
    let before = fixture.latest_adapter().await.unwrap();

    let request = TrainingRequest {
        examples: examples(3),
        settings: TrainingSettings {
            num_epochs: 3,
            batch_size: 2,
            learning_rate: 0.05,
        },
    };
    let id = fixture.orchestrator.start_training(request).unwrap();
    let task = fixture.wait(id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.kind, TaskKind::Training);
    assert_eq!(task.progress, 100);

    let records = fixture.history.training_records().await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.id, id);
    assert_eq!(record.model_id, MODEL);
    assert_eq!(record.epochs, 3);
    assert_eq!(record.batch_size, 2);
    assert_eq!(record.num_examples, 3);
    assert!(record.final_loss > 0.);

    // the trained adapter is the newest one and differs from the initial one
    assert_ne!(record.adapter, before);
    assert_eq!(fixture.latest_adapter().await, Some(record.adapter.clone()));
    let trained = fixture.adapters.extract(&record.adapter).await.unwrap();
    let initial = fixture.adapters.extract(&before).await.unwrap();
    assert_ne!(trained, initial);
    assert_eq!(
        trained.names().collect::<Vec<_>>(),
        initial.names().collect::<Vec<_>>()
    );

    let stats = fixture.orchestrator.training_stats().await.unwrap();
    assert_eq!(stats.total_training_sessions, 1);
    assert_eq!(stats.last_training_time, Some(record.completion_time));
    assert_eq!(stats.last_loss, Some(record.final_loss));
}

#[tokio::test]
async fn test_training_without_data() {
    let fixture = FixtureBuilder::new().build().await;
    let id = fixture
        .orchestrator
        .start_training(TrainingRequest::default())
        .unwrap();
    let task = fixture.wait(id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("no training data available"));
    assert!(fixture.history.training_records().await.unwrap().is_empty());

    let stats = fixture.orchestrator.training_stats().await.unwrap();
    assert_eq!(stats.total_training_sessions, 0);
    assert!(stats.last_loss.is_none());
}

#[tokio::test]
async fn test_training_rejects_invalid_settings() {
    let fixture = FixtureBuilder::new().build().await;
    let request = TrainingRequest {
        examples: examples(1),
        settings: TrainingSettings {
            num_epochs: 0,
            ..TrainingSettings::default()
        },
    };
    assert!(matches!(
        fixture.orchestrator.start_training(request),
        Err(StartError::InvalidRequest(_))
    ));
    assert!(fixture.orchestrator.tracker().is_empty());
}

#[tokio::test]
async fn test_training_requires_model() {
    let fixture = FixtureBuilder::new().without_model().build().await;
    let request = TrainingRequest {
        examples: examples(1),
        ..TrainingRequest::default()
    };
    assert!(matches!(
        fixture.orchestrator.start_training(request),
        Err(StartError::NoModelLoaded)
    ));
    assert!(fixture.runtime.active_model().is_none());
}

#[tokio::test]
async fn test_training_runtime_failure() {
    let dir = tempdir().unwrap();
    let mut runtime = MockModelRuntime::new();
    runtime.expect_active_model().returning(|| {
        Some(ModelInfo {
            model_id: MODEL.into(),
            loaded_at: Utc::now(),
        })
    });
    runtime
        .expect_train_epoch()
        .times(1)
        .returning(|_, _, _| Err(RuntimeError::Training("out of memory".into())));
    runtime.expect_adapter_weights().never();

    let history = Arc::new(InMemoryHistory::new());
    let orchestrator = Orchestrator::new(
        Arc::new(FsAdapterStore::new(dir.path())),
        history.clone(),
        Arc::new(runtime),
        Arc::new(SimulatedAggregator::new(Duration::ZERO, 0.)),
        default_budget(),
    );

    let request = TrainingRequest {
        examples: examples(4),
        settings: TrainingSettings {
            num_epochs: 3,
            ..TrainingSettings::default()
        },
    };
    let id = orchestrator.start_training(request).unwrap();
    let mut listener = orchestrator.tracker().subscribe(id).unwrap();
    let task = listener.terminal().await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.progress, 0);
    assert_eq!(task.error.as_deref(), Some("training failed: out of memory"));
    assert!(history.training_records().await.unwrap().is_empty());

    // the model was released
    assert!(orchestrator.start_sync(SyncRequest::default()).is_ok());
}
