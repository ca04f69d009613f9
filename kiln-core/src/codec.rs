//! Text to token conversion against the runtime vocabulary

use tracing::debug;

use crate::error::{Result, SessionError};
use crate::runtime::{InferenceRuntime, TokenId, TokenizeOutcome};

/// Ordered token ids produced for one prompt.
pub type TokenSequence = Vec<TokenId>;

/// Encoder/decoder borrowing a runtime and its loaded model.
pub struct TokenCodec<'a, R: InferenceRuntime> {
    runtime: &'a R,
    model: &'a R::Model,
}

impl<'a, R: InferenceRuntime> TokenCodec<'a, R> {
    pub fn new(runtime: &'a R, model: &'a R::Model) -> Self {
        Self { runtime, model }
    }

    /// Tokenize into `buf`, reporting the required capacity when it is too small.
    pub fn try_encode(&self, text: &str, buf: &mut [TokenId]) -> Result<TokenizeOutcome> {
        self.runtime
            .tokenize(self.model, text, true, buf)
            .map_err(|e| SessionError::TokenizeFailed(e.to_string()))
    }

    /// Tokenize with a buffer of exactly `capacity` ids.
    pub fn encode_with_capacity(&self, text: &str, capacity: usize) -> Result<TokenSequence> {
        let mut tokens = vec![0; capacity];
        match self.try_encode(text, &mut tokens)? {
            TokenizeOutcome::Written(n) => {
                tokens.truncate(n);
                Ok(tokens)
            }
            TokenizeOutcome::NeedsCapacity(required) => Err(SessionError::TokenizeFailed(
                format!("runtime asked for {required} ids after sizing at {capacity}"),
            )),
        }
    }

    /// Tokenize `text` with a beginning-of-sequence marker and no
    /// end-of-sequence marker.
    ///
    /// The first call probes with an empty buffer to learn the length, the
    /// second fills a buffer of that length.
    pub fn encode(&self, text: &str) -> Result<TokenSequence> {
        let tokens = match self.try_encode(text, &mut [])? {
            TokenizeOutcome::NeedsCapacity(required) => {
                self.encode_with_capacity(text, required)?
            }
            TokenizeOutcome::Written(_) => Vec::new(),
        };
        if tokens.is_empty() {
            return Err(SessionError::TokenizeFailed(
                "prompt produced no tokens".to_string(),
            ));
        }
        debug!("Tokenized: {} tokens", tokens.len());
        Ok(tokens)
    }

    /// Bytes of the text piece for `token`. Sub-word pieces may be partial
    /// UTF-8; join them with [`PieceStream`].
    pub fn decode(&self, token: TokenId) -> Vec<u8> {
        self.runtime.token_to_piece(self.model, token)
    }

    pub fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.runtime.is_end_of_generation(self.model, token)
    }
}

/// Concatenates token pieces and releases text at UTF-8 boundaries.
///
/// A multi-byte character split over two tokens is held back until its last
/// byte arrives, so streamed fragments are always valid text.
#[derive(Debug, Default)]
pub struct PieceStream {
    bytes: Vec<u8>,
    emitted: usize,
}

impl PieceStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one piece and return any newly completed text.
    pub fn push(&mut self, piece: &[u8]) -> Option<String> {
        self.bytes.extend_from_slice(piece);
        let pending = &self.bytes[self.emitted..];
        // Release through invalid sequences but keep an incomplete tail.
        let mut valid = 0;
        loop {
            match std::str::from_utf8(&pending[valid..]) {
                Ok(s) => {
                    valid += s.len();
                    break;
                }
                Err(e) => match e.error_len() {
                    Some(len) => valid += e.valid_up_to() + len,
                    None => {
                        valid += e.valid_up_to();
                        break;
                    }
                },
            }
        }
        if valid == 0 {
            return None;
        }
        let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
        self.emitted += valid;
        Some(text)
    }

    /// Whatever is still held back, lossily decoded.
    pub fn flush(&mut self) -> Option<String> {
        if self.emitted == self.bytes.len() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.bytes[self.emitted..]).into_owned();
        self.emitted = self.bytes.len();
        Some(text)
    }

    /// Everything pushed so far.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
