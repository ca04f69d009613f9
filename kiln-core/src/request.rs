use serde::{Deserialize, Serialize};

use crate::runtime::TokenId;

/// Temperatures at or below this pick the top candidate without drawing.
pub const GREEDY_TEMPERATURE: f32 = 1e-5;

/// Sampling parameters for generation
///
/// These are per-session defaults, not per-request knobs: the host bridge
/// only passes a prompt and a token budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Number of most recent tokens checked by the repetition penalty
    pub repeat_last_n: usize,
    /// Repetition penalty factor (1.0 = no penalty)
    pub repeat_penalty: f32,
    /// Keep only the k highest logits (0 = disabled)
    pub top_k: usize,
    /// Drop candidates below this fraction of the top probability
    pub min_p: f32,
    /// Nucleus threshold on cumulative probability
    pub top_p: f32,
    /// Logit divisor applied before the final draw
    pub temperature: f32,
    /// Seed for the final draw
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            repeat_last_n: 64,
            repeat_penalty: 1.1,
            top_k: 40,
            min_p: 0.05,
            top_p: 0.95,
            temperature: 0.8,
            seed: 42,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding: arg-max of whatever survives the filters.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= GREEDY_TEMPERATURE
    }

    /// Clamp every field into the range the chain is defined for.
    pub fn validated(&self) -> Self {
        let clamp = |v: f32, lo: f32, hi: f32| if v.is_nan() { lo } else { v.clamp(lo, hi) };
        Self {
            repeat_last_n: self.repeat_last_n,
            repeat_penalty: clamp(self.repeat_penalty, 1.0, 2.0),
            top_k: self.top_k,
            min_p: clamp(self.min_p, 0.0, 1.0),
            top_p: if self.top_p.is_nan() || self.top_p <= 0.0 {
                1.0
            } else {
                self.top_p.min(1.0)
            },
            temperature: clamp(self.temperature, 0.0, 2.0),
            seed: self.seed,
        }
    }
}

/// Why a generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model chose its end-of-generation token.
    Stop,
    /// The caller's token budget was used up.
    Length,
    /// The context window has no room for another position.
    ContextFull,
    /// A decode call failed; the text holds what was produced before it.
    DecodeFailed,
    /// The runtime returned no logits for the last position.
    LogitsUnavailable,
}

impl FinishReason {
    pub fn is_error(&self) -> bool {
        matches!(self, FinishReason::DecodeFailed | FinishReason::LogitsUnavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContextFull => "context_full",
            FinishReason::DecodeFailed => "decode_failed",
            FinishReason::LogitsUnavailable => "logits_unavailable",
        }
    }
}

/// Result of a single generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutcome {
    /// Generated text
    pub text: String,
    /// Generated tokens, end-of-generation token excluded
    pub tokens: Vec<TokenId>,
    /// Number of prompt tokens
    pub prompt_tokens: usize,
    /// Tokens per second over the whole call
    pub tokens_per_second: f64,
    pub finish_reason: FinishReason,
}

impl GenerationOutcome {
    pub fn generated_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_error(&self) -> bool {
        self.finish_reason.is_error()
    }
}
