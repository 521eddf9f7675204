//! Canonical representation of adapter parameters.
//!
//! A [`WeightMap`] maps parameter names to [`WeightValue`]s. Numeric parameters are stored as a
//! [`Tensor`], i.e. a shape and the row-major flattened values. Everything else an adapter file
//! may carry is kept as [`WeightValue::Opaque`] and is never touched by the privacy or merge
//! algorithms.
//!
//! Conversion from and to the loosely-typed nested-array format lives in the [`conversion`]
//! submodule and is meant to be used only at the edges (adapter files, aggregator payloads).

pub mod conversion;

use std::{
    collections::{btree_map, BTreeMap},
    convert::TryFrom,
    iter::FromIterator,
};

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::conversion::ConversionError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Errors related to the construction of a [`Tensor`].
pub enum TensorError {
    #[error("a tensor needs at least one dimension")]
    NoDimensions,
    #[error("dimension {index} of the shape {shape:?} is zero")]
    ZeroDimension { index: usize, shape: Vec<usize> },
    #[error("the shape {shape:?} requires {expected} values but {actual} were given")]
    LengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
/// A dense tensor of 64-bit floats.
///
/// The number of values always equals the product of the shape and every dimension is positive.
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = TensorError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        Tensor::new(raw.shape, raw.values)
    }
}

#[allow(clippy::len_without_is_empty)]
impl Tensor {
    /// Creates a tensor from its shape and its row-major flattened values.
    ///
    /// # Errors
    /// Fails if the shape is empty, contains a zero or doesn't match the number of values.
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, TensorError> {
        if shape.is_empty() {
            return Err(TensorError::NoDimensions);
        }
        if let Some(index) = shape.iter().position(|dim| *dim == 0) {
            return Err(TensorError::ZeroDimension { index, shape });
        }
        let expected = shape.iter().product::<usize>();
        if expected != values.len() {
            return Err(TensorError::LengthMismatch {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    /// Creates a rank-1 tensor.
    ///
    /// # Errors
    /// Fails if `values` is empty.
    pub fn vector(values: Vec<f64>) -> Result<Self, TensorError> {
        Self::new(vec![values.len()], values)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Gets mutable access to the values. The number of values can't be changed this way.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Gets the number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Computes the L2 norm over all elements.
    ///
    /// The elements are divided by the largest magnitude before squaring, so the norm of finite
    /// values stays finite unless it exceeds `f64::MAX` itself.
    pub fn l2_norm(&self) -> f64 {
        let max = self.values.iter().fold(0_f64, |max, v| max.max(v.abs()));
        if max == 0. || max.is_infinite() {
            return max;
        }
        let sum = self.values.iter().map(|v| (v / max).powi(2)).sum::<f64>();
        max * sum.sqrt()
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.values.iter_mut().for_each(|v| *v *= factor);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// A single named entry of a [`WeightMap`].
pub enum WeightValue {
    /// A numeric parameter tensor.
    Tensor(Tensor),
    /// Anything that isn't a numeric tensor. It is carried along unchanged.
    Opaque(serde_json::Value),
}

impl From<Tensor> for WeightValue {
    fn from(tensor: Tensor) -> Self {
        WeightValue::Tensor(tensor)
    }
}

impl WeightValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            WeightValue::Tensor(tensor) => Some(tensor),
            WeightValue::Opaque(_) => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        self.as_tensor().is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, From, Into, Serialize, Deserialize)]
/// An ordered mapping from unique parameter names to parameter values.
pub struct WeightMap(BTreeMap<String, WeightValue>);

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry and returns the previous value of that name, if any.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<WeightValue>,
    ) -> Option<WeightValue> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&WeightValue> {
        self.0.get(name)
    }

    /// Gets the tensor of the given name, if it exists and is a tensor.
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name).and_then(WeightValue::as_tensor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, WeightValue> {
        self.0.iter()
    }

    /// Iterates over the tensor entries only.
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.0
            .iter()
            .filter_map(|(name, value)| value.as_tensor().map(|tensor| (name.as_str(), tensor)))
    }

    /// Gets the number of scalar parameters over all tensors.
    pub fn parameter_count(&self) -> usize {
        self.tensors().map(|(_, tensor)| tensor.len()).sum()
    }

    /// Applies `f` to every tensor entry. Opaque entries are passed through as they are.
    pub fn map_tensors<F>(self, mut f: F) -> WeightMap
    where
        F: FnMut(&str, Tensor) -> Tensor,
    {
        self.0
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    WeightValue::Tensor(tensor) => WeightValue::Tensor(f(&name, tensor)),
                    opaque @ WeightValue::Opaque(_) => opaque,
                };
                (name, value)
            })
            .collect()
    }
}

impl FromIterator<(String, WeightValue)> for WeightMap {
    fn from_iter<I: IntoIterator<Item = (String, WeightValue)>>(iter: I) -> Self {
        WeightMap(iter.into_iter().collect())
    }
}

impl IntoIterator for WeightMap {
    type Item = (String, WeightValue);
    type IntoIter = btree_map::IntoIter<String, WeightValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a WeightMap {
    type Item = (&'a String, &'a WeightValue);
    type IntoIter = btree_map::Iter<'a, String, WeightValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
