use std::{sync::Arc, time::Duration};

use tempfile::{tempdir, TempDir};
use tokio::{sync::mpsc, time::timeout};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::{
    aggregator::{Aggregator, SimulatedAggregator},
    orchestrator::Orchestrator,
    runtime::{ModelRuntime, SimulatedRuntime, TrainingExample},
    storage::{AdapterRef, AdapterStorage, FsAdapterStore, InMemoryHistory},
    tasks::{Task, TaskId},
};
use fedsync_core::{PrivacyBudget, PrivacyEngine};

pub const MODEL: &str = "tiny";

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn default_budget() -> PrivacyBudget {
    PrivacyBudget::new(2., 1e-5, 1.).unwrap()
}

pub fn examples(count: usize) -> Vec<TrainingExample> {
    (0..count)
        .map(|i| TrainingExample {
            input: format!("question {}", i),
            output: format!("answer {}", i),
        })
        .collect()
}

/// An orchestrator wired to a simulated runtime, an adapter store in a temporary directory and an
/// in-memory history.
pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub adapters: Arc<FsAdapterStore>,
    pub history: Arc<InMemoryHistory>,
    pub runtime: Arc<SimulatedRuntime>,
    _dir: TempDir,
}

impl Fixture {
    /// Waits until the task is terminal.
    pub async fn wait(&self, id: TaskId) -> Task {
        let mut listener = self.orchestrator.tracker().subscribe(id).unwrap();
        timeout(Duration::from_secs(10), listener.terminal())
            .await
            .expect("task did not terminate in time")
    }

    pub async fn latest_adapter(&self) -> Option<AdapterRef> {
        self.adapters.latest(MODEL).await.unwrap()
    }
}

pub struct FixtureBuilder {
    aggregator: Arc<dyn Aggregator>,
    epoch_delay: Duration,
    download_step_delay: Duration,
    load_model: bool,
    persist_adapter: bool,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            aggregator: Arc::new(SimulatedAggregator::new(Duration::ZERO, 0.1).with_seed([9; 32])),
            epoch_delay: Duration::ZERO,
            download_step_delay: Duration::ZERO,
            load_model: true,
            persist_adapter: true,
        }
    }

    pub fn with_aggregator(mut self, aggregator: impl Aggregator) -> Self {
        self.aggregator = Arc::new(aggregator);
        self
    }

    /// Slows down every training epoch of the runtime.
    pub fn with_epoch_delay(mut self, delay: Duration) -> Self {
        self.epoch_delay = delay;
        self
    }

    /// Slows down every download step of the runtime, including the initial download.
    pub fn with_download_step_delay(mut self, delay: Duration) -> Self {
        self.download_step_delay = delay;
        self
    }

    /// Doesn't download and load a model.
    pub fn without_model(mut self) -> Self {
        self.load_model = false;
        self.persist_adapter = false;
        self
    }

    /// Loads a model but doesn't persist its initial adapter.
    pub fn without_adapter(mut self) -> Self {
        self.persist_adapter = false;
        self
    }

    pub async fn build(self) -> Fixture {
        let dir = tempdir().unwrap();
        let adapters = Arc::new(FsAdapterStore::new(dir.path().join("adapters")));
        let history = Arc::new(InMemoryHistory::new());
        let runtime = Arc::new(
            SimulatedRuntime::new(
                dir.path().join("models"),
                self.epoch_delay,
                self.download_step_delay,
            )
            .with_seed([7; 32]),
        );

        if self.load_model {
            let (tx, _rx) = mpsc::unbounded_channel();
            runtime.download(MODEL, tx).await.unwrap();
            runtime.load(MODEL).await.unwrap();
        }
        if self.persist_adapter {
            let weights = runtime.adapter_weights().await.unwrap();
            adapters.persist(MODEL, &weights).await.unwrap();
        }

        let orchestrator = Orchestrator::new(
            adapters.clone(),
            history.clone(),
            runtime.clone(),
            self.aggregator,
            default_budget(),
        )
        .with_privacy_engine(PrivacyEngine::from_seed([1; 32]));

        Fixture {
            orchestrator,
            adapters,
            history,
            runtime,
            _dir: dir,
        }
    }
}
