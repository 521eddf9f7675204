use std::{convert::TryFrom, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::aggregator::{
    AggregateRequest,
    AggregateResponse,
    Aggregator,
    AggregatorError,
    ExchangeResponse,
};
use fedsync_core::{PrivacyBudget, WeightMap};

/// An aggregator which is reached over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpAggregator {
    client: reqwest::Client,
    /// The base URL of the aggregator, without trailing slash.
    address: Arc<String>,
}

impl HttpAggregator {
    /// Creates a client for the aggregator at `url`. Every exchange is aborted after `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AggregatorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            address: Arc::new(url.trim_end_matches('/').to_string()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Aggregator for HttpAggregator {
    async fn exchange(
        &self,
        weights: &WeightMap,
        budget: &PrivacyBudget,
    ) -> Result<ExchangeResponse, AggregatorError> {
        let url = format!("{}/aggregate", self.address);
        debug!("sending {} adapter entries to {}", weights.len(), url);

        let response: AggregateResponse = self
            .client
            .post(&url)
            .json(&AggregateRequest::new(weights, budget))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let response = ExchangeResponse::try_from(response)?;
        info!(
            "aggregator answered with status {}, aggregate received: {}",
            response.status,
            response.aggregate.is_some()
        );
        Ok(response)
    }
}
