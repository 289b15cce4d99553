//! Errors surfaced at the queue and API boundary.

use thiserror::Error;

use crate::gate::GateError;
use crate::llm::LlmError;
use crate::run::TransitionError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    /// Fail-fast validation of a run request or its configuration.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("run queue is shut down")]
    QueueClosed,
}

impl From<GateError> for EngineError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::NotFound(id) => EngineError::NotFound(format!("confirmation {}", id)),
            GateError::Conflict { .. } | GateError::AlreadyPending(_) => {
                EngineError::Conflict(err.to_string())
            }
            GateError::Storage(e) => EngineError::Storage(e),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
