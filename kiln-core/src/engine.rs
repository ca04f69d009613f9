//! Generation engine - the autoregressive decode loop
//!
//! One call walks `PromptPending -> Decoding -> (TokenEmitted -> Decoding)* -> Terminated`:
//! clear the cache, submit the prompt, then sample and submit one token at a
//! time until end-of-generation, the token budget, the context window, or a
//! runtime failure ends it. Failures after the prompt is tokenized never
//! become errors; they end the loop with whatever text was produced.

use std::time::Instant;

use tracing::{debug, error, warn};

use crate::batcher::{Batch, BatchBuilder};
use crate::codec::{PieceStream, TokenCodec};
use crate::error::{Result, SessionError};
use crate::request::{FinishReason, GenerationOutcome, SamplingParams};
use crate::runtime::{InferenceRuntime, TokenId};
use crate::sampler::SamplingChain;

/// Phase of a single generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    /// Prompt tokens haven't been submitted yet.
    PromptPending,
    /// Logits for the latest position are ready to sample.
    Decoding,
    /// A token was appended and is waiting to be submitted.
    TokenEmitted(TokenId),
    /// Generation is over.
    Terminated(FinishReason),
}

/// Drives one generation over borrowed runtime handles.
///
/// Borrows never outlive the call; the session owns the handles.
pub struct GenerationEngine<'a, R: InferenceRuntime> {
    runtime: &'a mut R,
    model: &'a R::Model,
    context: &'a mut R::Context,
    context_size: usize,
}

impl<'a, R: InferenceRuntime> GenerationEngine<'a, R> {
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

    /// Generate text from a prompt
    pub fn generate(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        params: &SamplingParams,
    ) -> Result<GenerationOutcome> {
        self.generate_streaming(prompt, None, max_tokens, params, |_| {})
    }

    /// Generate with streaming output
    ///
    /// `on_text` receives each completed piece of text as soon as it is
    /// decoded. `image`, when given, is fed to the runtime before the prompt.
    pub fn generate_streaming<F>(
        &mut self,
        prompt: &str,
        image: Option<&[u8]>,
        max_tokens: usize,
        params: &SamplingParams,
        mut on_text: F,
    ) -> Result<GenerationOutcome>
    where
        F: FnMut(&str),
    {
        let start_time = Instant::now();

        if image.is_some() && !self.runtime.supports_image_input() {
            return Err(SessionError::Unsupported(format!(
                "{} has no image input",
                self.runtime.name()
            )));
        }

        let prompt_tokens = TokenCodec::new(&*self.runtime, self.model).encode(prompt)?;
        let prompt_len = prompt_tokens.len();

        let mut chain = SamplingChain::with_history(params.clone(), &prompt_tokens);
        let mut builder = BatchBuilder::new(self.runtime.max_batch_size(self.context));
        let mut stream = PieceStream::new();
        let mut generated: Vec<TokenId> = Vec::with_capacity(max_tokens.min(self.context_size));
        let mut output_index = 0usize;
        let mut phase = DecodePhase::PromptPending;

        // Never reuse a previous generation's attention state.
        self.runtime.clear_kv_cache(self.context);

        let finish_reason = loop {
            phase = match phase {
                DecodePhase::PromptPending => {
                    if let Some(image) = image {
                        let used = self
                            .runtime
                            .ingest_image(self.context, image, builder.position())
                            .map_err(|e| {
                                error!("Failed to ingest image: {}", e);
                                SessionError::DecodeFailed(e.to_string())
                            })?;
                        builder.advance(used);
                    }
                    let needed = builder.position() + prompt_len;
                    if needed > self.context_size {
                        return Err(SessionError::PromptTooLong {
                            tokens: needed,
                            context: self.context_size,
                        });
                    }
                    match self.submit_prompt(&mut builder, &prompt_tokens) {
                        Some(index) if max_tokens > 0 => {
                            output_index = index;
                            DecodePhase::Decoding
                        }
                        Some(_) => DecodePhase::Terminated(FinishReason::Length),
                        None => DecodePhase::Terminated(FinishReason::DecodeFailed),
                    }
                }
                DecodePhase::Decoding => match self.runtime.logits(self.context, output_index) {
                    None => {
                        error!(
                            "Logits unavailable at batch index {} after {} tokens",
                            output_index,
                            generated.len()
                        );
                        DecodePhase::Terminated(FinishReason::LogitsUnavailable)
                    }
                    Some(logits) => match chain.sample(logits) {
                        None => {
                            warn!("Runtime returned an empty logit vector");
                            DecodePhase::Terminated(FinishReason::LogitsUnavailable)
                        }
                        Some(token) => {
                            let codec = TokenCodec::new(&*self.runtime, self.model);
                            if codec.is_end_of_generation(token) {
                                debug!("End of generation (EOS token {})", token);
                                DecodePhase::Terminated(FinishReason::Stop)
                            } else {
                                if let Some(text) = stream.push(&codec.decode(token)) {
                                    on_text(&text);
                                }
                                generated.push(token);
                                chain.accept(token);
                                DecodePhase::TokenEmitted(token)
                            }
                        }
                    },
                },
                DecodePhase::TokenEmitted(token) => {
                    if generated.len() >= max_tokens {
                        DecodePhase::Terminated(FinishReason::Length)
                    } else if builder.position() >= self.context_size {
                        DecodePhase::Terminated(FinishReason::ContextFull)
                    } else {
                        let batch = builder.single(token);
                        match self.runtime.decode(self.context, &batch) {
                            Ok(()) => {
                                output_index = 0;
                                DecodePhase::Decoding
                            }
                            Err(e) => {
                                error!("Failed to decode token {}: {}", token, e);
                                DecodePhase::Terminated(FinishReason::DecodeFailed)
                            }
                        }
                    }
                }
                DecodePhase::Terminated(reason) => break reason,
            };
        };

        if let Some(text) = stream.flush() {
            on_text(&text);
        }

        let elapsed = start_time.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed > 0.0 {
            generated.len() as f64 / elapsed
        } else {
            0.0
        };
        debug!(
            "Generated {} tokens ({}), {:.2} tok/s",
            generated.len(),
            finish_reason.as_str(),
            tokens_per_second
        );

        Ok(GenerationOutcome {
            text: stream.text(),
            tokens: generated,
            prompt_tokens: prompt_len,
            tokens_per_second,
            finish_reason,
        })
    }

    /// Submit the prompt in as many batches as the runtime needs.
    /// Returns the batch index holding the last prompt token's logits.
    fn submit_prompt(&mut self, builder: &mut BatchBuilder, tokens: &[TokenId]) -> Option<usize> {
        let batches = builder.prompt(tokens, true);
        let output_index = batches.last().and_then(Batch::output_index)?;
        for batch in &batches {
            if let Err(e) = self.runtime.decode(self.context, batch) {
                error!("Failed to decode prompt: {}", e);
                return None;
            }
        }
        Some(output_index)
    }
}
