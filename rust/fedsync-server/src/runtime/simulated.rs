//! A simulated model runtime.
//!
//! It doesn't run a language model. Downloads only leave a marker file in the models directory,
//! the adapter is a small low-rank pair of random matrices and a training epoch nudges every
//! adapter weight by a random step scaled with the learning rate.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_json::json;
use tokio::{fs, sync::mpsc, time::sleep};
use tracing::{debug, info};

use crate::runtime::{
    EpochStats,
    ModelInfo,
    ModelRuntime,
    RuntimeError,
    TrainingExample,
    TrainingSettings,
};
use fedsync_core::{Tensor, WeightMap, WeightValue};

/// The rank of the simulated adapter.
pub const ADAPTER_RANK: usize = 4;
/// The hidden size of the simulated model.
pub const HIDDEN_SIZE: usize = 16;

const MARKER_FILE: &str = "model.json";

#[derive(Debug, Default)]
struct State {
    active: Option<ModelInfo>,
    adapter: Option<WeightMap>,
}

#[derive(Debug)]
pub struct SimulatedRuntime {
    models_dir: PathBuf,
    epoch_delay: Duration,
    download_step_delay: Duration,
    state: RwLock<State>,
    prng: Mutex<ChaCha20Rng>,
}

impl SimulatedRuntime {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        epoch_delay: Duration,
        download_step_delay: Duration,
    ) -> Self {
        Self {
            models_dir: models_dir.into(),
            epoch_delay,
            download_step_delay,
            state: RwLock::new(State::default()),
            prng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    /// Makes the simulated weights reproducible.
    pub fn with_seed(self, seed: [u8; 32]) -> Self {
        Self {
            prng: Mutex::new(ChaCha20Rng::from_seed(seed)),
            ..self
        }
    }

    fn model_dir(&self, model_id: &str) -> Result<PathBuf, RuntimeError> {
        if model_id.is_empty() || model_id.contains(['/', '\\']) || model_id.starts_with('.') {
            Err(RuntimeError::UnknownModel(model_id.to_string()))
        } else {
            Ok(self.models_dir.join(model_id))
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn initial_adapter(&self) -> WeightMap {
        let mut prng = self.prng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut random = |len: usize| {
            (0..len)
                .map(|_| prng.gen_range(-0.02..0.02))
                .collect::<Vec<f64>>()
        };

        let mut adapter = WeightMap::new();
        for (name, shape) in [
            ("lora_A", vec![ADAPTER_RANK, HIDDEN_SIZE]),
            ("lora_B", vec![HIDDEN_SIZE, ADAPTER_RANK]),
        ] {
            let values = random(ADAPTER_RANK * HIDDEN_SIZE);
            // the shape always matches the number of values
            if let Ok(tensor) = Tensor::new(shape, values) {
                adapter.insert(name, tensor);
            }
        }
        adapter.insert(
            "adapter_config",
            WeightValue::Opaque(json!({
                "r": ADAPTER_RANK,
                "lora_alpha": 2 * ADAPTER_RANK,
                "target_modules": ["q_proj", "v_proj"],
            })),
        );
        adapter
    }

    fn with_state<T, F>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(&mut State) -> Result<T, RuntimeError>,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.active.is_none() {
            return Err(RuntimeError::NoModelLoaded);
        }
        f(&mut state)
    }
}

#[async_trait]
impl ModelRuntime for SimulatedRuntime {
    fn active_model(&self) -> Option<ModelInfo> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .clone()
    }

    async fn download(
        &self,
        model_id: &str,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<(), RuntimeError> {
        let dir = self.model_dir(model_id)?;
        fs::create_dir_all(&dir).await?;

        for percent in (0..100).step_by(5) {
            // nobody listening is fine
            let _ = progress.send(percent);
            sleep(self.download_step_delay).await;
        }
        let marker = json!({ "model_id": model_id, "downloaded_at": Utc::now() });
        fs::write(dir.join(MARKER_FILE), marker.to_string()).await?;
        let _ = progress.send(100);

        info!("downloaded model {}", model_id);
        Ok(())
    }

    async fn load(&self, model_id: &str) -> Result<ModelInfo, RuntimeError> {
        let marker = self.model_dir(model_id)?.join(MARKER_FILE);
        if !fs::try_exists(&marker).await.unwrap_or(false) {
            return Err(RuntimeError::UnknownModel(model_id.to_string()));
        }

        let info = ModelInfo {
            model_id: model_id.to_string(),
            loaded_at: Utc::now(),
        };
        let adapter = self.initial_adapter();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.active = Some(info.clone());
        state.adapter = Some(adapter);

        info!("loaded model {}", model_id);
        Ok(info)
    }

    async fn train_epoch(
        &self,
        examples: &[TrainingExample],
        settings: &TrainingSettings,
        epoch: u32,
    ) -> Result<EpochStats, RuntimeError> {
        if examples.is_empty() {
            return Err(RuntimeError::Training("no training examples".into()));
        }
        sleep(self.epoch_delay).await;

        let mut prng = self.prng.lock().unwrap_or_else(PoisonError::into_inner);
        let learning_rate = settings.learning_rate;
        self.with_state(|state| {
            if let Some(adapter) = state.adapter.take() {
                state.adapter = Some(adapter.map_tensors(|_, mut tensor| {
                    tensor
                        .values_mut()
                        .iter_mut()
                        .for_each(|value| *value -= learning_rate * prng.gen_range(-1.0..1.0));
                    tensor
                }));
            }
            Ok(())
        })?;

        let loss = 2.5 / f64::from(epoch + 1) * (1. + prng.gen_range(-0.05..0.05));
        debug!("epoch {} over {} examples, loss {:.4}", epoch, examples.len(), loss);
        Ok(EpochStats { epoch, loss })
    }

    async fn adapter_weights(&self) -> Result<WeightMap, RuntimeError> {
        self.with_state(|state| state.adapter.clone().ok_or(RuntimeError::NoModelLoaded))
    }

    async fn apply_adapter(&self, weights: &WeightMap) -> Result<(), RuntimeError> {
        self.with_state(|state| {
            state.adapter = Some(weights.clone());
            Ok(())
        })
    }
}
