//! Error taxonomy for the evaluation pipeline (spec §7).
//!
//! `anyhow` is still used at process boundaries (main, job runner) for
//! ad-hoc context; this enum exists for the handful of call sites that
//! must branch on *kind* rather than just propagate-and-log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("llm call failed: {0}")]
    LlmFailure(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("config conflict: {0}")]
    ConfigConflict(String),

    #[error("fatal startup failure: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
