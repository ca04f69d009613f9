//! Kiln Core - stateful session layer over an LLM inference runtime
//!
//! This crate implements the logic between a host and a model runtime:
//! - One loaded model/context pair per session, behind one lock
//! - Two-phase tokenization and batch assembly
//! - The decode loop with repetition penalty, top-k, min-p, top-p and temperature sampling
//! - Final-position embeddings
//! - A host bridge that reports failures as values, plus a rule-based fallback
//! - A candle runtime for quantized GGUF llama models (`candle` feature)

pub mod error;
pub mod runtime;
pub mod request;
pub mod codec;
pub mod sampler;
pub mod batcher;
pub mod engine;
pub mod embedding;
pub mod model;
pub mod metrics;
pub mod session;
pub mod bridge;
pub mod fallback;
#[cfg(feature = "candle")]
pub mod candle_runtime;

pub use error::{Result, RuntimeError, SessionError};
pub use runtime::{ContextParams, InferenceRuntime, ModelParams, TokenId, TokenizeOutcome};
pub use request::{FinishReason, GenerationOutcome, SamplingParams, GREEDY_TEMPERATURE};
pub use codec::{PieceStream, TokenCodec, TokenSequence};
pub use sampler::{Candidates, SamplingCandidate, SamplingChain};
pub use batcher::{Batch, BatchBuilder, BatchEntry};
pub use engine::{DecodePhase, GenerationEngine};
pub use embedding::EmbeddingExtractor;
pub use model::{sha256_hex, verify_model_file, ModelConfig, VerificationReport, DEFAULT_CONTEXT_SIZE};
pub use metrics::{InferenceStats, PerformanceMonitor, PerformanceSnapshot};
pub use session::{ModelInfo, ModelSession, SessionState, SessionStats};
pub use bridge::{error_marker, is_error_marker, HostBridge, ERROR_PREFIX};
pub use fallback::FallbackResponder;
#[cfg(feature = "candle")]
pub use candle_runtime::{CandleContext, CandleModel, CandleRuntime};
