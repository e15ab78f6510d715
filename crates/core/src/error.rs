//! Error taxonomy for the orchestration core.

use async_openai::error::OpenAIError;
use thiserror::Error;

/// Violations of the append-only message log contract.
///
/// These indicate a programming error in the caller and are never recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("message id '{0}' already exists in the conversation")]
    DuplicateId(String),
    #[error("cannot replace the last {requested} messages of a log holding {len}")]
    TailOutOfRange { requested: usize, len: usize },
}

/// Failures of the completion provider, normalized across backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("network error while streaming completion: {0}")]
    Network(String),
    #[error("completion provider returned an error: {0}")]
    Provider(String),
    #[error("completion stream ended before signalling completion")]
    Interrupted,
}

impl From<OpenAIError> for CompletionError {
    fn from(err: OpenAIError) -> Self {
        match err {
            OpenAIError::Reqwest(e) => Self::Network(e.to_string()),
            OpenAIError::ApiError(e) => Self::Provider(e.message),
            other => Self::Provider(other.to_string()),
        }
    }
}

/// Failures of the durable chat store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("chat store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to serialize chat record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything that can end a live turn early.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

/// Errors returned synchronously from an action, before any handle is handed out.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("conversation '{0}' already has a turn in flight")]
    TurnInProgress(String),
    #[error("failed to encode function result: {0}")]
    Serialization(#[from] serde_json::Error),
}
