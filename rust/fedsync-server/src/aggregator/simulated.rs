use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::time::sleep;
use tracing::info;
use uuid::Uuid;

use crate::aggregator::{Aggregator, AggregatorError, ExchangeResponse};
use fedsync_core::{PrivacyBudget, WeightMap};

/// An aggregator that runs in-process.
///
/// After a delay it answers with an aggregate that is the sent update where every value is
/// scaled by a random factor in `[1 - jitter, 1 + jitter]`, standing in for the updates of the
/// other participants.
#[derive(Debug)]
pub struct SimulatedAggregator {
    delay: Duration,
    jitter: f64,
    prng: Mutex<ChaCha20Rng>,
}

impl SimulatedAggregator {
    pub fn new(delay: Duration, jitter: f64) -> Self {
        Self {
            delay,
            jitter: jitter.abs(),
            prng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    pub fn with_seed(self, seed: [u8; 32]) -> Self {
        Self {
            prng: Mutex::new(ChaCha20Rng::from_seed(seed)),
            ..self
        }
    }
}

#[async_trait]
impl Aggregator for SimulatedAggregator {
    async fn exchange(
        &self,
        weights: &WeightMap,
        budget: &PrivacyBudget,
    ) -> Result<ExchangeResponse, AggregatorError> {
        sleep(self.delay).await;

        let aggregate = {
            let mut prng = self.prng.lock().unwrap_or_else(PoisonError::into_inner);
            let jitter = self.jitter;
            weights.clone().map_tensors(|_, mut tensor| {
                if jitter > 0. {
                    tensor
                        .values_mut()
                        .iter_mut()
                        .for_each(|value| *value *= 1. + prng.gen_range(-jitter..=jitter));
                }
                tensor
            })
        };

        info!(
            "simulated aggregation of {} parameters (epsilon = {})",
            weights.parameter_count(),
            budget.epsilon
        );
        Ok(ExchangeResponse {
            status: "success".to_string(),
            message: Some("update aggregated".to_string()),
            contribution_id: Some(Uuid::new_v4().to_string()),
            aggregate: Some(aggregate),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use fedsync_core::{Tensor, WeightValue};

    fn weights() -> WeightMap {
        let mut weights = WeightMap::new();
        weights.insert("w", Tensor::vector(vec![1., -2., 4.]).unwrap());
        weights.insert("config", WeightValue::Opaque(json!({"r": 4})));
        weights
    }

    #[tokio::test]
    async fn test_exchange_with_jitter() {
        let aggregator = SimulatedAggregator::new(Duration::ZERO, 0.1).with_seed([3; 32]);
        let budget = PrivacyBudget::new(1., 1e-5, 1.).unwrap();

        let response = aggregator.exchange(&weights(), &budget).await.unwrap();
        assert_eq!(response.status, "success");
        assert!(response.contribution_id.is_some());

        let aggregate = response.aggregate.unwrap();
        assert_eq!(aggregate.get("config"), weights().get("config"));
        let sent = weights();
        let sent = sent.tensor("w").unwrap();
        let received = aggregate.tensor("w").unwrap();
        assert_eq!(received.shape(), sent.shape());
        for (received, sent) in received.values().iter().zip(sent.values()) {
            let ratio = received / sent;
            assert!((0.899..=1.101).contains(&ratio), "ratio {} out of range", ratio);
        }
    }

    #[tokio::test]
    async fn test_exchange_without_jitter() {
        let aggregator = SimulatedAggregator::new(Duration::ZERO, 0.);
        let budget = PrivacyBudget::new(1., 1e-5, 1.).unwrap();
        let response = aggregator.exchange(&weights(), &budget).await.unwrap();
        assert_eq!(response.aggregate, Some(weights()));
    }
}
