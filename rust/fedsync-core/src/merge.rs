//! Reconciliation of a local weight map with a remote aggregate.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::weights::{Tensor, WeightMap, WeightValue};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A local tensor which could not be merged because the remote entry doesn't match it.
pub struct ShapeMismatch {
    pub name: String,
    pub local: Vec<usize>,
    /// The shape of the remote entry, or `None` if the remote entry is not a tensor.
    pub remote: Option<Vec<usize>>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shape mismatch for {}: local {:?}, ", self.name, self.local)?;
        match &self.remote {
            Some(shape) => write!(f, "remote {:?}", shape),
            None => write!(f, "remote is not a tensor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The result of a [`merge()`].
pub struct MergeOutcome {
    /// The merged weights. They have exactly the names and shapes of the local weights.
    pub merged: WeightMap,
    /// The local tensors which were retained unchanged because of a mismatch.
    pub mismatches: Vec<ShapeMismatch>,
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Merges a remote aggregate into the local weights.
///
/// The local weights define the parameter surface:
/// - a local tensor with a remote tensor of the same shape becomes the elementwise mean of both,
/// - a local tensor with a differently shaped or non-tensor remote entry is retained and
///   reported as a [`ShapeMismatch`],
/// - a local entry without remote counterpart and every opaque local entry are retained,
/// - remote-only entries are ignored.
///
/// The mean is unweighted, i.e. local and remote contribute equally.
pub fn merge(local: WeightMap, remote: &WeightMap) -> MergeOutcome {
    let mut mismatches = Vec::new();

    let merged = local.map_tensors(|name, tensor| match remote.get(name) {
        None => tensor,
        Some(WeightValue::Tensor(other)) if other.shape() == tensor.shape() => {
            average(tensor, other)
        }
        Some(other) => {
            let mismatch = ShapeMismatch {
                name: name.to_string(),
                local: tensor.shape().to_vec(),
                remote: other.as_tensor().map(|t| t.shape().to_vec()),
            };
            warn!("{}, keeping the local value", mismatch);
            mismatches.push(mismatch);
            tensor
        }
    });

    MergeOutcome { merged, mismatches }
}

fn average(mut local: Tensor, remote: &Tensor) -> Tensor {
    local
        .values_mut()
        .iter_mut()
        .zip(remote.values())
        .for_each(|(l, r)| *l = (*l + r) / 2.);
    local
}
