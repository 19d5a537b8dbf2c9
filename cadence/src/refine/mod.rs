//! Fixed-iteration refinement loop run once every milestone is complete.
//!
//! Each iteration fans review producers out over a bounded worker pool,
//! aggregates their findings, hands them to a single refine producer, runs the
//! validation command and closes the iteration. The loop always records
//! exactly N iterations; producer failures only reduce content.

pub mod aggregate;
pub mod orchestrator;
pub mod pool;
pub mod producer;
pub mod report;
pub mod validator;

use thiserror::Error;

/// Why a producer contributed nothing. Logged and counted, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerFailure {
    #[error("producer failed: {0}")]
    Errored(String),
    #[error("producer timed out after {0}s")]
    TimedOut(u64),
    #[error("producer panicked: {0}")]
    Panicked(String),
    #[error("producer output rejected: {0}")]
    Malformed(String),
}

pub use orchestrator::{RefineProducers, RefineRunOutcome, RefineSettings, run_refine};
pub use producer::{RefineProducer, RefineRequest, ReviewProducer, ReviewRequest};
pub use validator::{CommandValidator, Validator};
pub use crate::process::CancelToken;
