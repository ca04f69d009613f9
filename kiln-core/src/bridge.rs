//! Host bridge - the five-operation surface handed to a host
//!
//! Hosts never see a `Result`. Failures come back as `false`, `None`, or a
//! text marker starting with [`ERROR_PREFIX`], so nothing propagates across
//! the boundary as a fault.

use std::path::Path;

use tracing::warn;

use crate::error::{Result, SessionError};
use crate::request::{FinishReason, GenerationOutcome};
use crate::runtime::InferenceRuntime;
use crate::session::{ModelSession, SessionStats};

/// Start of every error marker returned from [`HostBridge::generate`].
pub const ERROR_PREFIX: &str = "[ERROR: ";

/// Marker text for an error, e.g. `[ERROR: model not loaded]`.
pub fn error_marker(error: &SessionError) -> String {
    format!("{ERROR_PREFIX}{error}]")
}

/// Whether `text` carries an error marker anywhere.
pub fn is_error_marker(text: &str) -> bool {
    text.contains(ERROR_PREFIX)
}

/// Flatten a generation result into host text.
///
/// Mid-generation failures keep the partial text and append a marker on its
/// own line.
pub fn outcome_text(result: Result<GenerationOutcome>) -> String {
    match result {
        Ok(outcome) => {
            let error = match outcome.finish_reason {
                FinishReason::DecodeFailed => Some(SessionError::DecodeFailed(
                    format!("stopped after {} tokens", outcome.generated_tokens()),
                )),
                FinishReason::LogitsUnavailable => {
                    Some(SessionError::LogitsUnavailable)
                }
                _ => None,
            };
            match error {
                None => outcome.text,
                Some(e) if outcome.text.is_empty() => error_marker(&e),
                Some(e) => format!("{}\n{}", outcome.text, error_marker(&e)),
            }
        }
        Err(e) => error_marker(&e),
    }
}

/// Synchronous operations exposed to a host.
pub trait HostBridge: Send + Sync {
    /// Backend name for logs and status pages.
    fn backend_name(&self) -> &str;

    fn load(&self, path: &str, context_size: i32) -> bool;

    /// Generated text, or an error marker. `None` is a missing prompt.
    fn generate(&self, prompt: Option<&str>, max_tokens: i32) -> String;

    fn generate_with_image(&self, prompt: Option<&str>, image: &[u8], max_tokens: i32) -> String;

    fn embed(&self, prompt: Option<&str>) -> Option<Vec<f32>>;

    fn free(&self);

    fn is_loaded(&self) -> bool;

    fn stats(&self) -> Option<SessionStats> {
        None
    }
}

fn missing_prompt() -> SessionError {
    SessionError::InvalidInput("prompt is null".to_string())
}

impl<R: InferenceRuntime> HostBridge for ModelSession<R> {
    fn backend_name(&self) -> &str {
        ModelSession::backend_name(self)
    }

    fn load(&self, path: &str, context_size: i32) -> bool {
        ModelSession::load(self, Path::new(path), context_size).is_ok()
    }

    fn generate(&self, prompt: Option<&str>, max_tokens: i32) -> String {
        match prompt {
            Some(prompt) => outcome_text(ModelSession::generate(self, prompt, max_tokens)),
            None => error_marker(&missing_prompt()),
        }
    }

    fn generate_with_image(&self, prompt: Option<&str>, image: &[u8], max_tokens: i32) -> String {
        match prompt {
            Some(prompt) => {
                outcome_text(ModelSession::generate_with_image(self, prompt, image, max_tokens))
            }
            None => error_marker(&missing_prompt()),
        }
    }

    fn embed(&self, prompt: Option<&str>) -> Option<Vec<f32>> {
        let prompt = prompt?;
        match ModelSession::embed(self, prompt) {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("Embedding unavailable: {}", e);
                None
            }
        }
    }

    fn free(&self) {
        ModelSession::free(self)
    }

    fn is_loaded(&self) -> bool {
        ModelSession::is_loaded(self)
    }

    fn stats(&self) -> Option<SessionStats> {
        Some(ModelSession::stats(self))
    }
}
