//! Inference runtime interface
//!
//! The session drives text generation but never touches tensors itself. All
//! tokenization, forward passes and logit/embedding storage happen behind
//! [`InferenceRuntime`]. A runtime hands out opaque model and context handles
//! which the session owns exclusively and returns on free.

use std::path::Path;

use crate::batcher::Batch;
use crate::error::RuntimeError;

/// Vocabulary entry id as used by the runtime.
pub type TokenId = i32;

/// Parameters for loading model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelParams {
    /// Number of layers to offload to an accelerator, if the runtime has one.
    pub gpu_layers: u32,
}

/// Parameters for creating an inference context over a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Maximum number of positions the context can hold.
    pub context_size: usize,
    /// CPU threads used for the forward pass.
    pub threads: usize,
    /// Maximum number of tokens accepted by a single decode call.
    pub batch_size: usize,
}

/// Result of a tokenize call against a caller-provided buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeOutcome {
    /// The buffer was large enough; this many ids were written.
    Written(usize),
    /// The buffer was too small; nothing useful was written.
    NeedsCapacity(usize),
}

/// Opaque inference backend consumed by the session.
///
/// Handles are plain owned values: the session keeps them for as long as
/// the model is loaded and gives them back through [`free_context`] and
/// [`free_model`] in reverse order of acquisition.
///
/// [`free_context`]: InferenceRuntime::free_context
/// [`free_model`]: InferenceRuntime::free_model
pub trait InferenceRuntime: Send {
    /// Loaded weights and vocabulary.
    type Model: Send;
    /// Per-session decode state: key-value cache and output buffers.
    type Context: Send;

    /// Short backend name used in logs and metrics.
    fn name(&self) -> &str;

    /// Initialise process-wide backend state. Called before the first load.
    fn backend_init(&mut self);

    /// Tear down process-wide backend state. Called after the last free.
    fn backend_shutdown(&mut self);

    fn load_model(&mut self, path: &Path, params: &ModelParams)
        -> Result<Self::Model, RuntimeError>;

    fn create_context(
        &mut self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, RuntimeError>;

    fn free_context(&mut self, context: Self::Context);

    fn free_model(&mut self, model: Self::Model);

    /// Tokenize `text` into `out`.
    ///
    /// When `out` is too small the call reports the capacity it needs and
    /// the caller retries with a buffer of that size.
    fn tokenize(
        &self,
        model: &Self::Model,
        text: &str,
        add_bos: bool,
        out: &mut [TokenId],
    ) -> Result<TokenizeOutcome, RuntimeError>;

    /// Raw bytes of the text piece for one token. May be empty.
    fn token_to_piece(&self, model: &Self::Model, token: TokenId) -> Vec<u8>;

    /// Whether `token` ends generation (end-of-sequence or end-of-turn).
    fn is_end_of_generation(&self, model: &Self::Model, token: TokenId) -> bool;

    fn vocab_size(&self, model: &Self::Model) -> usize;

    /// Width of the hidden state returned by [`embeddings`](Self::embeddings).
    fn embedding_size(&self, model: &Self::Model) -> usize;

    /// Largest batch a single [`decode`](Self::decode) accepts on this context.
    fn max_batch_size(&self, context: &Self::Context) -> usize;

    /// Drop every cached position so the next decode starts from scratch.
    fn clear_kv_cache(&mut self, context: &mut Self::Context);

    fn decode(&mut self, context: &mut Self::Context, batch: &Batch) -> Result<(), RuntimeError>;

    /// Logits for entry `batch_index` of the last decoded batch, if that entry
    /// requested them and the runtime still holds them.
    fn logits<'a>(&self, context: &'a Self::Context, batch_index: usize) -> Option<&'a [f32]>;

    /// Hidden state for entry `batch_index` of the last decoded batch.
    fn embeddings<'a>(&self, context: &'a Self::Context, batch_index: usize)
        -> Option<&'a [f32]>;

    /// Whether [`embeddings`](Self::embeddings) can return a vector at all.
    fn supports_embeddings(&self) -> bool {
        true
    }

    /// Whether [`ingest_image`](Self::ingest_image) is implemented.
    fn supports_image_input(&self) -> bool {
        false
    }

    /// Feed an encoded image into the context starting at `position`.
    /// Returns the number of positions the image occupies.
    fn ingest_image(
        &mut self,
        _context: &mut Self::Context,
        _image: &[u8],
        _position: usize,
    ) -> Result<usize, RuntimeError> {
        Err(RuntimeError::new(format!(
            "{} does not accept image input",
            self.name()
        )))
    }
}
