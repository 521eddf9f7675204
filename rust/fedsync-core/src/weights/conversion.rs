//! Conversion between [`WeightMap`]s and nested JSON arrays.
//!
//! Adapter files and aggregator payloads carry parameters as a JSON object whose values are
//! nested arrays of numbers, e.g. `{"lora_A": [[0.1, 0.2], [0.3, 0.4]]}`. A value is converted
//! into a [`Tensor`] iff it is a non-empty, rectangular array of numbers of rank one or higher.
//! Every other value (scalars, strings, objects, ragged or mixed arrays) becomes
//! [`WeightValue::Opaque`].
//!
//! The types themselves are documented in the [weights module].
//!
//! [weights module]: crate::weights

use serde_json::{Map, Value};
use thiserror::Error;

use crate::weights::{Tensor, WeightMap, WeightValue};

#[derive(Debug, Error)]
/// Errors related to the conversion of nested JSON into a [`WeightMap`].
pub enum ConversionError {
    #[error("expected a JSON object of named parameters, found {0}")]
    NotAnObject(&'static str),
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Tensor {
    /// Converts a nested array of numbers into a tensor.
    ///
    /// Returns `None` if `value` is not a non-empty rectangular array of numbers.
    pub fn from_nested(value: &Value) -> Option<Tensor> {
        let mut shape = Vec::new();
        let mut cursor = value;
        while let Value::Array(items) = cursor {
            shape.push(items.len());
            cursor = items.first()?;
        }
        if shape.is_empty() {
            return None;
        }

        let mut values = Vec::with_capacity(shape.iter().product());
        flatten(value, &shape, &mut values)?;
        Tensor::new(shape, values).ok()
    }

    /// Converts this tensor into nested arrays following its shape.
    pub fn to_nested(&self) -> Value {
        nest(self.shape(), self.values())
    }
}

fn flatten(value: &Value, shape: &[usize], out: &mut Vec<f64>) -> Option<()> {
    match (value, shape.split_first()) {
        (Value::Number(number), None) => {
            out.push(number.as_f64()?);
            Some(())
        }
        (Value::Array(items), Some((dim, rest))) if items.len() == *dim => {
            for item in items {
                flatten(item, rest, out)?;
            }
            Some(())
        }
        _ => None,
    }
}

fn nest(shape: &[usize], values: &[f64]) -> Value {
    match shape {
        [] | [_] => Value::Array(values.iter().map(|v| Value::from(*v)).collect()),
        [_, rest @ ..] => {
            let stride = rest.iter().product::<usize>();
            Value::Array(
                values
                    .chunks(stride)
                    .map(|chunk| nest(rest, chunk))
                    .collect(),
            )
        }
    }
}

impl WeightValue {
    /// Converts a loosely-typed JSON value into a weight value.
    pub fn from_json(value: Value) -> WeightValue {
        match Tensor::from_nested(&value) {
            Some(tensor) => WeightValue::Tensor(tensor),
            None => WeightValue::Opaque(value),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            WeightValue::Tensor(tensor) => tensor.to_nested(),
            WeightValue::Opaque(value) => value.clone(),
        }
    }
}

impl WeightMap {
    /// Converts a JSON object of nested arrays into a weight map.
    ///
    /// # Errors
    /// Fails if `value` is not a JSON object.
    pub fn from_json(value: Value) -> Result<WeightMap, ConversionError> {
        match value {
            Value::Object(entries) => Ok(entries
                .into_iter()
                .map(|(name, value)| (name, WeightValue::from_json(value)))
                .collect()),
            other => Err(ConversionError::NotAnObject(kind(&other))),
        }
    }

    /// Converts this weight map into a JSON object of nested arrays.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect::<Map<String, Value>>(),
        )
    }
}
