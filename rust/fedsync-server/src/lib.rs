#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedsync: private adapter synchronization
//!
//! A local backend which fine-tunes a small adapter on top of a frozen language model and shares
//! it with a remote aggregator under (ε, δ)-differential privacy.
//!
//! A synchronization runs as a background task:
//!
//! 1. the latest adapter of the active model is read from the [adapter storage],
//! 2. every tensor is clipped and perturbed with calibrated Gaussian noise,
//! 3. the privatized adapter is exchanged with the [aggregator],
//! 4. a returned aggregate is averaged into the local adapter, which is persisted and activated.
//!
//! Downloads and training runs are background tasks as well. Every task can be polled for its
//! progress through the [REST API].
//!
//! The numerical building blocks live in the `fedsync-core` crate.
//!
//! [adapter storage]: crate::storage::AdapterStorage
//! [aggregator]: crate::aggregator::Aggregator
//! [REST API]: crate::rest

pub mod aggregator;
pub mod orchestrator;
pub mod rest;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod tasks;
