//! Prompt embedding extraction
//!
//! The whole prompt is submitted without logit flags and the hidden state at
//! the final position is read back.

use tracing::{debug, error, warn};

use crate::batcher::BatchBuilder;
use crate::codec::TokenCodec;
use crate::error::{Result, SessionError};
use crate::runtime::InferenceRuntime;

/// Reads the final-position hidden state for a prompt.
pub struct EmbeddingExtractor<'a, R: InferenceRuntime> {
    runtime: &'a mut R,
    model: &'a R::Model,
    context: &'a mut R::Context,
    context_size: usize,
}

impl<'a, R: InferenceRuntime> EmbeddingExtractor<'a, R> {
    pub fn new(
        runtime: &'a mut R,
        model: &'a R::Model,
        context: &'a mut R::Context,
        context_size: usize,
    ) -> Self {
        Self {
            runtime,
            model,
            context,
            context_size,
        }
    }

    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let tokens = TokenCodec::new(&*self.runtime, self.model).encode(text)?;
        if tokens.len() > self.context_size {
            return Err(SessionError::PromptTooLong {
                tokens: tokens.len(),
                context: self.context_size,
            });
        }

        let mut builder = BatchBuilder::new(self.runtime.max_batch_size(self.context));
        let batches = builder.prompt(&tokens, false);
        let last_index = batches
            .last()
            .and_then(|b| b.last_index())
            .ok_or(SessionError::EmbeddingsUnavailable)?;

        for batch in &batches {
            self.runtime.decode(self.context, batch).map_err(|e| {
                error!("Failed to decode embedding prompt: {}", e);
                SessionError::DecodeFailed(e.to_string())
            })?;
        }

        let vector = self
            .runtime
            .embeddings(self.context, last_index)
            .ok_or(SessionError::EmbeddingsUnavailable)?;

        let expected = self.runtime.embedding_size(self.model);
        if vector.len() != expected {
            warn!(
                "Embedding has {} values, model reports {}",
                vector.len(),
                expected
            );
        }
        debug!("Embedded {} tokens into {} values", tokens.len(), vector.len());
        Ok(vector.to_vec())
    }
}
