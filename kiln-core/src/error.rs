//! Error types for the session core

use thiserror::Error;

/// Result type alias using the session error
pub type Result<T> = std::result::Result<T, SessionError>;

/// Failure kinds surfaced by [`ModelSession`](crate::ModelSession) operations.
///
/// Every variant is a value the caller can branch on; none of them is ever
/// raised as a panic across the host boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("model not loaded")]
    NotLoaded,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("load failed: {0}")]
    LoadFailed(String),

    #[error("tokenize failed: {0}")]
    TokenizeFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("logits unavailable")]
    LogitsUnavailable,

    #[error("embeddings unavailable")]
    EmbeddingsUnavailable,

    #[error("prompt too long: {tokens} tokens exceed context of {context}")]
    PromptTooLong { tokens: usize, context: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Error reported by an [`InferenceRuntime`](crate::InferenceRuntime) call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RuntimeError {
    message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for RuntimeError {
    fn from(e: anyhow::Error) -> Self {
        // Keep the whole context chain, the runtime boundary flattens to text.
        Self::new(format!("{e:#}"))
    }
}
