//! Model session - owns the runtime handles and serializes access to them
//!
//! Every operation that touches the runtime takes the same lock, so a load
//! never interleaves with a generation and two generations never share the
//! key-value cache. The lifecycle state is mirrored into an atomic so
//! [`ModelSession::is_loaded`] can answer without waiting for that lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::embedding::EmbeddingExtractor;
use crate::engine::GenerationEngine;
use crate::error::{Result, SessionError};
use crate::metrics::{PerformanceMonitor, PerformanceSnapshot};
use crate::model::{verify_model_file, ModelConfig};
use crate::request::{FinishReason, GenerationOutcome};
use crate::runtime::InferenceRuntime;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
    Freed,
}

impl SessionState {
    fn to_u8(self) -> u8 {
        match self {
            SessionState::Unloaded => 0,
            SessionState::Loading => 1,
            SessionState::Ready => 2,
            SessionState::Generating => 3,
            SessionState::Freed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Loading,
            2 => SessionState::Ready,
            3 => SessionState::Generating,
            4 => SessionState::Freed,
            _ => SessionState::Unloaded,
        }
    }

    /// Whether model and context handles are held.
    pub fn has_handles(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Generating)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
            SessionState::Freed => "freed",
        }
    }
}

/// Static facts about the loaded model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub context_size: usize,
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub size_bytes: u64,
}

/// Session statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub backend: String,
    pub model: Option<ModelInfo>,
    pub performance: PerformanceSnapshot,
}

struct Loaded<R: InferenceRuntime> {
    model: R::Model,
    context: R::Context,
    context_size: usize,
}

struct Inner<R: InferenceRuntime> {
    runtime: R,
    backend_ready: bool,
    loaded: Option<Loaded<R>>,
}

/// One loaded model/context pair behind one lock.
pub struct ModelSession<R: InferenceRuntime> {
    inner: Mutex<Inner<R>>,
    state: AtomicU8,
    info: Mutex<Option<ModelInfo>>,
    config: ModelConfig,
    backend: String,
    image_input: bool,
    embedding_output: bool,
    monitor: PerformanceMonitor,
}

impl<R: InferenceRuntime> ModelSession<R> {
    pub fn new(runtime: R, config: ModelConfig) -> Self {
        let backend = runtime.name().to_string();
        let image_input = runtime.supports_image_input();
        let embedding_output = runtime.supports_embeddings();
        Self {
            inner: Mutex::new(Inner {
                runtime,
                backend_ready: false,
                loaded: None,
            }),
            state: AtomicU8::new(SessionState::Unloaded.to_u8()),
            info: Mutex::new(None),
            config: ModelConfig {
                sampling: config.sampling.validated(),
                ..config
            },
            backend,
            image_input,
            embedding_output,
            monitor: PerformanceMonitor::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        &self.backend
    }

    pub fn supports_image_input(&self) -> bool {
        self.image_input
    }

    pub fn supports_embeddings(&self) -> bool {
        self.embedding_output
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Current lifecycle state. Never blocks.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while model and context handles are held. Never blocks.
    pub fn is_loaded(&self) -> bool {
        self.state().has_handles()
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Load a model file, replacing any model already loaded.
    ///
    /// A non-positive `context_size` selects the configured default. On
    /// failure the session is left `Unloaded` and can be loaded again.
    pub fn load(&self, path: impl AsRef<Path>, context_size: i32) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(SessionError::InvalidInput("model path is empty".to_string()));
        }

        let mut inner = self.inner.lock();
        if inner.loaded.is_some() {
            info!("Replacing loaded model");
            self.release(&mut inner);
        }
        self.set_state(SessionState::Loading);

        match self.load_locked(&mut inner, path, context_size) {
            Ok(()) => {
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                error!("Failed to load {}: {}", path.display(), e);
                if inner.backend_ready {
                    inner.runtime.backend_shutdown();
                    inner.backend_ready = false;
                }
                *self.info.lock() = None;
                self.set_state(SessionState::Unloaded);
                Err(e)
            }
        }
    }

    fn load_locked(&self, inner: &mut Inner<R>, path: &Path, context_size: i32) -> Result<()> {
        let start = Instant::now();
        let size_bytes =
            verify_model_file(path, self.config.expected_sha256.as_deref()).into_result()?;
        let context_size = self.config.effective_context_size(context_size);
        info!("Loading model: {} (context {})", path.display(), context_size);

        if !inner.backend_ready {
            inner.runtime.backend_init();
            inner.backend_ready = true;
        }

        let model = inner
            .runtime
            .load_model(path, &self.config.model_params())
            .map_err(|e| SessionError::LoadFailed(e.to_string()))?;

        let context = match inner
            .runtime
            .create_context(&model, &self.config.context_params(context_size))
        {
            Ok(context) => context,
            Err(e) => {
                inner.runtime.free_model(model);
                return Err(SessionError::LoadFailed(format!(
                    "failed to create context: {e}"
                )));
            }
        };

        let info = ModelInfo {
            path: path.to_path_buf(),
            context_size,
            vocab_size: inner.runtime.vocab_size(&model),
            embedding_size: inner.runtime.embedding_size(&model),
            size_bytes,
        };
        info!("Model loaded successfully in {:.2?}", start.elapsed());
        info!("  - Backend: {}", self.backend);
        info!("  - Vocab size: {}", info.vocab_size);
        info!("  - Embedding size: {}", info.embedding_size);
        info!("  - Context size: {}", info.context_size);
        if !self.embedding_output {
            warn!("{} has no embedding output, embed requests will be rejected", self.backend);
        }

        // Speed history belongs to the model it was measured on.
        self.monitor.clear();
        inner.loaded = Some(Loaded {
            model,
            context,
            context_size,
        });
        *self.info.lock() = Some(info);
        Ok(())
    }

    /// Generate up to `max_tokens` tokens continuing `prompt`.
    pub fn generate(&self, prompt: &str, max_tokens: i32) -> Result<GenerationOutcome> {
        self.run_generation(prompt, None, max_tokens, |_| {})
    }

    /// Like [`generate`](Self::generate), handing each text fragment to
    /// `on_text` as soon as it is decoded. The callback runs under the
    /// session lock.
    pub fn generate_streaming<F>(
        &self,
        prompt: &str,
        max_tokens: i32,
        on_text: F,
    ) -> Result<GenerationOutcome>
    where
        F: FnMut(&str),
    {
        self.run_generation(prompt, None, max_tokens, on_text)
    }

    /// Generate conditioned on an encoded image. Runtimes without image input
    /// return [`SessionError::Unsupported`].
    pub fn generate_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        max_tokens: i32,
    ) -> Result<GenerationOutcome> {
        if !self.image_input {
            return Err(SessionError::Unsupported(format!(
                "{} has no image input",
                self.backend
            )));
        }
        if image.is_empty() {
            return Err(SessionError::InvalidInput("image is empty".to_string()));
        }
        self.run_generation(prompt, Some(image), max_tokens, |_| {})
    }

    fn run_generation<F>(
        &self,
        prompt: &str,
        image: Option<&[u8]>,
        max_tokens: i32,
        on_text: F,
    ) -> Result<GenerationOutcome>
    where
        F: FnMut(&str),
    {
        if prompt.is_empty() {
            return Err(SessionError::InvalidInput("prompt is empty".to_string()));
        }

        let mut inner = self.inner.lock();
        let Inner {
            runtime, loaded, ..
        } = &mut *inner;
        let loaded = loaded.as_mut().ok_or(SessionError::NotLoaded)?;

        if max_tokens <= 0 {
            debug!("Non-positive token budget ({}), nothing to generate", max_tokens);
            return Ok(GenerationOutcome {
                text: String::new(),
                tokens: Vec::new(),
                prompt_tokens: 0,
                tokens_per_second: 0.0,
                finish_reason: FinishReason::Length,
            });
        }

        self.set_state(SessionState::Generating);
        let start = Instant::now();
        let result = GenerationEngine::new(
            runtime,
            &loaded.model,
            &mut loaded.context,
            loaded.context_size,
        )
        .generate_streaming(
            prompt,
            image,
            max_tokens as usize,
            &self.config.sampling,
            on_text,
        );
        self.set_state(SessionState::Ready);

        match &result {
            Ok(outcome) => {
                self.monitor
                    .record_inference(outcome.generated_tokens(), start.elapsed(), &self.backend);
                if outcome.is_error() {
                    warn!(
                        "Generation ended early ({}) after {} tokens",
                        outcome.finish_reason.as_str(),
                        outcome.generated_tokens()
                    );
                }
            }
            Err(e) => warn!("Generation failed: {}", e),
        }
        result
    }

    /// Hidden-state vector for the final position of `prompt`. Runtimes
    /// without embedding output return [`SessionError::Unsupported`].
    pub fn embed(&self, prompt: &str) -> Result<Vec<f32>> {
        if !self.embedding_output {
            return Err(SessionError::Unsupported(format!(
                "{} has no embedding output",
                self.backend
            )));
        }
        if prompt.is_empty() {
            return Err(SessionError::InvalidInput("prompt is empty".to_string()));
        }

        let mut inner = self.inner.lock();
        let Inner {
            runtime, loaded, ..
        } = &mut *inner;
        let loaded = loaded.as_mut().ok_or(SessionError::NotLoaded)?;

        self.set_state(SessionState::Generating);
        let result = EmbeddingExtractor::new(
            runtime,
            &loaded.model,
            &mut loaded.context,
            loaded.context_size,
        )
        .embed(prompt);
        self.set_state(SessionState::Ready);

        if let Err(e) = &result {
            warn!("Embedding failed: {}", e);
        }
        result
    }

    /// Release the context, the model and the backend. Does nothing when no
    /// model is loaded.
    pub fn free(&self) {
        let mut inner = self.inner.lock();
        if inner.loaded.is_none() && !inner.backend_ready {
            debug!("Free called with nothing loaded");
            return;
        }
        self.release(&mut inner);
        if inner.backend_ready {
            inner.runtime.backend_shutdown();
            inner.backend_ready = false;
        }
        self.set_state(SessionState::Freed);
        if self.monitor.total_inferences() > 0 {
            info!("{}", self.monitor.summary(&self.backend));
        }
        info!("Model freed");
    }

    /// Context first, then model.
    fn release(&self, inner: &mut Inner<R>) {
        if let Some(loaded) = inner.loaded.take() {
            inner.runtime.free_context(loaded.context);
            inner.runtime.free_model(loaded.model);
        }
        *self.info.lock() = None;
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.info.lock().clone()
    }

    /// Snapshot of state, model facts and generation speed. Never waits for
    /// a running generation.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            backend: self.backend.clone(),
            model: self.model_info(),
            performance: self.monitor.snapshot(),
        }
    }
}

impl<R: InferenceRuntime> Drop for ModelSession<R> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(loaded) = inner.loaded.take() {
            inner.runtime.free_context(loaded.context);
            inner.runtime.free_model(loaded.model);
        }
        if inner.backend_ready {
            inner.runtime.backend_shutdown();
            inner.backend_ready = false;
        }
    }
}
