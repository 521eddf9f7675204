//! Orchestrator test utilities.

pub mod utils;

mod training;
