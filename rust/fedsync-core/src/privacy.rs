//! Differential privacy for weight maps.
//!
//! The mechanism follows the usual clip-then-noise pattern:
//!
//! 1. [`clip()`] bounds the L2 norm of every tensor by `clip_norm`, which bounds the sensitivity of
//!    a single contribution.
//! 2. [`calibrate_noise_scale()`] derives the standard deviation of the Gaussian mechanism for a
//!    requested `(epsilon, delta)` pair and a sensitivity:
//!    `sensitivity * sqrt(2 * ln(1.25 / delta)) / epsilon`.
//! 3. [`PrivacyEngine::privatize()`] adds independent zero-mean Gaussian noise of that scale to
//!    every element.
//!
//! Opaque entries of a [`WeightMap`] are never touched by any of these operations.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::weights::WeightMap;

/// The sensitivity assumed when weights are released without prior clipping.
pub const DEFAULT_SENSITIVITY: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Error)]
/// Errors related to privacy parameters.
pub enum PrivacyError {
    #[error("invalid privacy parameter {name} = {value}: {requirement}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        requirement: &'static str,
    },
}

fn invalid(name: &'static str, value: f64, requirement: &'static str) -> PrivacyError {
    PrivacyError::InvalidParameter {
        name,
        value,
        requirement,
    }
}

fn check_epsilon(epsilon: f64) -> Result<(), PrivacyError> {
    if epsilon.is_finite() && epsilon > 0. {
        Ok(())
    } else {
        Err(invalid("epsilon", epsilon, "must be finite and > 0"))
    }
}

fn check_delta(delta: f64) -> Result<(), PrivacyError> {
    if 0. < delta && delta < 1. {
        Ok(())
    } else {
        Err(invalid("delta", delta, "must be in (0, 1)"))
    }
}

fn check_clip_norm(clip_norm: f64) -> Result<(), PrivacyError> {
    if clip_norm.is_finite() && clip_norm > 0. {
        Ok(())
    } else {
        Err(invalid("clip_norm", clip_norm, "must be finite and > 0"))
    }
}

fn check_sensitivity(sensitivity: f64) -> Result<(), PrivacyError> {
    if sensitivity.is_finite() && sensitivity >= 0. {
        Ok(())
    } else {
        Err(invalid("sensitivity", sensitivity, "must be finite and >= 0"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// The privacy parameters of a single release.
pub struct PrivacyBudget {
    /// The privacy loss bound. Smaller means more privacy and more noise.
    pub epsilon: f64,
    /// The failure probability, in `(0, 1)`.
    pub delta: f64,
    /// The maximal L2 norm of every released tensor.
    pub clip_norm: f64,
}

impl PrivacyBudget {
    /// Creates a validated budget.
    ///
    /// # Errors
    /// Fails if one of the parameters is out of range.
    pub fn new(epsilon: f64, delta: f64, clip_norm: f64) -> Result<Self, PrivacyError> {
        let budget = Self {
            epsilon,
            delta,
            clip_norm,
        };
        budget.validate()?;
        Ok(budget)
    }

    /// Checks that `epsilon > 0`, `0 < delta < 1` and `clip_norm > 0` and that they yield a
    /// finite noise scale.
    pub fn validate(&self) -> Result<(), PrivacyError> {
        check_clip_norm(self.clip_norm)?;
        self.noise_scale().map(|_| ())
    }

    /// Computes the noise scale for this budget, using the clipping norm as sensitivity.
    pub fn noise_scale(&self) -> Result<f64, PrivacyError> {
        calibrate_noise_scale(self.epsilon, self.delta, self.clip_norm)
    }
}

/// Computes the standard deviation of the Gaussian mechanism.
///
/// `scale = sensitivity * sqrt(2 * ln(1.25 / delta)) / epsilon`
///
/// # Errors
/// Fails if `epsilon <= 0`, if `delta` is not in `(0, 1)` or if `sensitivity` is negative. Non
/// finite values are rejected as well, and so are a `delta` or an `epsilon` so small that the
/// scale overflows.
pub fn calibrate_noise_scale(
    epsilon: f64,
    delta: f64,
    sensitivity: f64,
) -> Result<f64, PrivacyError> {
    check_epsilon(epsilon)?;
    check_delta(delta)?;
    check_sensitivity(sensitivity)?;

    let ratio = 1.25 / delta;
    if !ratio.is_finite() {
        return Err(invalid("delta", delta, "too small, 1.25 / delta overflows"));
    }
    let scale = sensitivity * (2. * ratio.ln()).sqrt() / epsilon;
    if scale.is_finite() {
        Ok(scale)
    } else {
        Err(invalid("epsilon", epsilon, "too small, the noise scale overflows"))
    }
}

/// Clips every tensor to an L2 norm of at most `clip_norm`.
///
/// A tensor whose norm exceeds `clip_norm` is rescaled by `clip_norm / norm`. Any other tensor is
/// returned exactly as it was.
///
/// # Errors
/// Fails if `clip_norm` is not positive and finite.
pub fn clip(weights: WeightMap, clip_norm: f64) -> Result<WeightMap, PrivacyError> {
    check_clip_norm(clip_norm)?;
    Ok(weights.map_tensors(|name, mut tensor| {
        let norm = tensor.l2_norm();
        if norm > clip_norm {
            debug!("clipping {} from norm {} to {}", name, norm, clip_norm);
            tensor.scale(clip_norm / norm);
        }
        tensor
    }))
}

#[derive(Debug, Clone)]
/// Perturbs weight maps with calibrated Gaussian noise.
///
/// The noise source is a seedable PRNG. Its output only needs to be statistically sound, so a
/// fixed seed may be used to make tests reproducible.
pub struct PrivacyEngine<R = ChaCha20Rng> {
    prng: R,
}

impl PrivacyEngine<ChaCha20Rng> {
    /// Creates an engine seeded from the operating system's entropy source.
    pub fn new() -> Self {
        Self::with_rng(ChaCha20Rng::from_entropy())
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::with_rng(ChaCha20Rng::from_seed(seed))
    }
}

impl Default for PrivacyEngine<ChaCha20Rng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> PrivacyEngine<R> {
    pub fn with_rng(prng: R) -> Self {
        Self { prng }
    }

    /// See [`clip()`].
    pub fn clip(&self, weights: WeightMap, clip_norm: f64) -> Result<WeightMap, PrivacyError> {
        clip(weights, clip_norm)
    }

    /// Adds independent `N(0, scale²)` noise to every tensor element, where the scale is
    /// calibrated from `epsilon`, `delta` and `sensitivity`. Use [`DEFAULT_SENSITIVITY`] when the
    /// weights have not been clipped.
    ///
    /// # Errors
    /// Fails if the parameters are invalid, see [`calibrate_noise_scale()`].
    pub fn privatize(
        &mut self,
        weights: WeightMap,
        epsilon: f64,
        delta: f64,
        sensitivity: f64,
    ) -> Result<WeightMap, PrivacyError> {
        let scale = calibrate_noise_scale(epsilon, delta, sensitivity)?;
        let normal =
            Normal::new(0., scale).map_err(|_| invalid("noise scale", scale, "must be >= 0"))?;
        debug!(
            "adding gaussian noise with scale {} (epsilon = {}, delta = {})",
            scale, epsilon, delta
        );

        let prng = &mut self.prng;
        Ok(weights.map_tensors(|_, mut tensor| {
            tensor
                .values_mut()
                .iter_mut()
                .for_each(|value| *value += normal.sample(&mut *prng));
            tensor
        }))
    }

    /// Clips the gradients to `clip_norm` and then adds noise calibrated to a sensitivity of
    /// `clip_norm`.
    ///
    /// # Errors
    /// Fails if the parameters are invalid. Nothing is clipped in that case.
    pub fn privatize_gradients(
        &mut self,
        gradients: WeightMap,
        epsilon: f64,
        delta: f64,
        clip_norm: f64,
    ) -> Result<WeightMap, PrivacyError> {
        check_clip_norm(clip_norm)?;
        calibrate_noise_scale(epsilon, delta, clip_norm)?;
        let clipped = clip(gradients, clip_norm)?;
        self.privatize(clipped, epsilon, delta, clip_norm)
    }

    /// Applies [`privatize_gradients()`] with the parameters of the given budget.
    ///
    /// [`privatize_gradients()`]: PrivacyEngine::privatize_gradients
    pub fn privatize_with_budget(
        &mut self,
        weights: WeightMap,
        budget: &PrivacyBudget,
    ) -> Result<WeightMap, PrivacyError> {
        self.privatize_gradients(weights, budget.epsilon, budget.delta, budget.clip_norm)
    }
}
