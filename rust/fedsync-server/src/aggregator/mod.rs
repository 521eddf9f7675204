//! The remote aggregator.
//!
//! A privatized adapter is sent to the aggregator, which may answer with an aggregate of the
//! updates of many participants. An answer without aggregate is not an error, it only means that
//! there is nothing to merge.
//!
//! # Wire format
//!
//! The HTTP aggregator is called with `POST <url>/aggregate` and a JSON body
//!
//! ```text
//! {"weights": {"lora_A": [[...]], ...}, "epsilon": 2.0, "delta": 1e-5}
//! ```
//!
//! and answers with
//!
//! ```text
//! {"status": "success", "message": "...", "client_contribution_id": "...",
//!  "updated_weights": {"lora_A": [[...]], ...}}
//! ```
//!
//! where every field except `status` is optional. A `status` of `"error"` means that the update
//! was rejected.

pub mod http;
pub mod simulated;

pub use self::{http::HttpAggregator, simulated::SimulatedAggregator};

use std::convert::TryFrom;

use async_trait::async_trait;
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use fedsync_core::{PrivacyBudget, WeightMap};

/// The answer of the aggregator to an exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeResponse {
    pub status: String,
    pub message: Option<String>,
    pub contribution_id: Option<String>,
    /// The aggregate to merge, if any.
    pub aggregate: Option<WeightMap>,
}

#[derive(Debug, Display, Error)]
/// Errors of the exchange with the aggregator.
pub enum AggregatorError {
    /// aggregator request failed: {0}
    Http(#[from] reqwest::Error),
    /// aggregator rejected the update: {0}
    Rejected(String),
    /// invalid aggregator response: {0}
    InvalidResponse(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Aggregator: Send + Sync + 'static {
    /// Sends privatized weights together with the privacy parameters they satisfy.
    async fn exchange(
        &self,
        weights: &WeightMap,
        budget: &PrivacyBudget,
    ) -> Result<ExchangeResponse, AggregatorError>;
}

/// The request body of the aggregator protocol.
#[derive(Debug, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub weights: Value,
    pub epsilon: f64,
    pub delta: f64,
}

impl AggregateRequest {
    pub fn new(weights: &WeightMap, budget: &PrivacyBudget) -> Self {
        Self {
            weights: weights.to_json(),
            epsilon: budget.epsilon,
            delta: budget.delta,
        }
    }
}

/// The response body of the aggregator protocol.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_contribution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_weights: Option<Value>,
}

impl TryFrom<AggregateResponse> for ExchangeResponse {
    type Error = AggregatorError;

    fn try_from(response: AggregateResponse) -> Result<Self, Self::Error> {
        if response.status == "error" {
            return Err(AggregatorError::Rejected(
                response
                    .message
                    .unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        let aggregate = match response.updated_weights {
            None | Some(Value::Null) => None,
            Some(weights) => Some(
                WeightMap::from_json(weights)
                    .map_err(|err| AggregatorError::InvalidResponse(err.to_string()))?,
            ),
        };
        Ok(Self {
            status: response.status,
            message: response.message,
            contribution_id: response.client_contribution_id,
            aggregate,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_response_with_aggregate() {
        let response: AggregateResponse = serde_json::from_value(json!({
            "status": "success",
            "client_contribution_id": "c-1",
            "updated_weights": {"w": [[1.0, 2.0]], "r": 4},
        }))
        .unwrap();
        let response = ExchangeResponse::try_from(response).unwrap();
        assert_eq!(response.contribution_id.as_deref(), Some("c-1"));
        let aggregate = response.aggregate.unwrap();
        assert_eq!(aggregate.tensor("w").unwrap().shape(), &[1, 2]);
        assert!(!aggregate.get("r").unwrap().is_tensor());
    }

    #[test]
    fn test_response_without_aggregate() {
        for body in [
            json!({"status": "success", "message": "stored"}),
            json!({"status": "success", "updated_weights": null}),
        ] {
            let response: AggregateResponse = serde_json::from_value(body).unwrap();
            assert!(ExchangeResponse::try_from(response)
                .unwrap()
                .aggregate
                .is_none());
        }
    }

    #[test]
    fn test_response_errors() {
        let rejected = AggregateResponse {
            status: "error".into(),
            message: Some("round closed".into()),
            ..AggregateResponse::default()
        };
        assert_eq!(
            ExchangeResponse::try_from(rejected).unwrap_err().to_string(),
            "aggregator rejected the update: round closed"
        );

        let invalid = AggregateResponse {
            status: "success".into(),
            updated_weights: Some(json!([1, 2, 3])),
            ..AggregateResponse::default()
        };
        assert!(matches!(
            ExchangeResponse::try_from(invalid),
            Err(AggregatorError::InvalidResponse(_))
        ));
    }
}
