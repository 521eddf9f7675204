#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Fedsync core: private federated adapter synchronization
//!
//! This crate holds the pure, I/O-free building blocks of the adapter synchronization pipeline.
//! A locally trained adapter is represented as a [`WeightMap`], bounded and perturbed by the
//! [`PrivacyEngine`] so that releasing it satisfies an (ε,δ)-differential-privacy guarantee,
//! exchanged with a remote aggregator and finally merged back into the local adapter with
//! [`merge()`].
//!
//! - [`weights`]: the canonical `name → (shape, flat values)` representation and its conversion
//!   from and to loosely-typed nested arrays, which is the format used on disk and on the wire.
//! - [`privacy`]: L2-norm clipping, noise calibration for the Gaussian mechanism and noise
//!   injection.
//! - [`merge`]: shape-checked elementwise averaging of a local and a remote weight map.
//! - [`schedule`]: the synchronization frequency policy.
//!
//! Everything that touches storage, the network or a background worker lives in the
//! `fedsync-server` crate.
//!
//! [`WeightMap`]: crate::weights::WeightMap
//! [`PrivacyEngine`]: crate::privacy::PrivacyEngine
//! [`merge()`]: crate::merge::merge

pub mod merge;
pub mod privacy;
pub mod schedule;
pub mod weights;

pub use self::{
    merge::{merge, MergeOutcome, ShapeMismatch},
    privacy::{calibrate_noise_scale, PrivacyBudget, PrivacyEngine, PrivacyError},
    schedule::{next_run, SchedulePolicy, SyncFrequency},
    weights::{Tensor, TensorError, WeightMap, WeightValue},
};
