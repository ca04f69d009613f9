//! Rule-based responder used when no inference runtime is available
//!
//! Satisfies the same [`HostBridge`] contract as a real session, always
//! reports itself as loaded, and answers from a fixed keyword table.

use tracing::{debug, info};

use crate::bridge::{error_marker, HostBridge};
use crate::error::SessionError;

/// Width of the zero vector returned by [`FallbackResponder::embed`].
pub const FALLBACK_EMBEDDING_SIZE: usize = 384;

const IMAGE_REPLY: &str = "I can see you've shared an image with me! However, I'm running in \
fallback mode without vision support, so I can't describe it yet.";

/// Keyword rules, checked in order. The first match wins.
const RULES: &[(Match, &str)] = &[
    (
        Match::Word(&["hello", "hi", "hey"]),
        "Hello! I'm your assistant. How can I help you today?",
    ),
    (
        Match::Phrase("how are you"),
        "I'm doing great, thank you for asking! I'm ready to help with any questions you have.",
    ),
    (
        Match::Phrase("weather"),
        "I don't have access to current weather data right now. Your local weather app will have \
         the most accurate forecast.",
    ),
    (
        Match::Phrase("time"),
        "I don't have access to the current time, but your device's clock does.",
    ),
    (
        Match::Phrase("help"),
        "I'm here to help! I can answer general questions and keep you company in conversation. \
         What would you like to know?",
    ),
    (
        Match::Phrase("name"),
        "I'm an offline assistant running in fallback mode.",
    ),
];

#[derive(Debug, Clone, Copy)]
enum Match {
    /// Any of these appears as a whole word.
    Word(&'static [&'static str]),
    /// Appears anywhere in the prompt.
    Phrase(&'static str),
}

impl Match {
    fn matches(&self, lower: &str) -> bool {
        match self {
            Match::Word(words) => lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|w| words.contains(&w)),
            Match::Phrase(phrase) => lower.contains(phrase),
        }
    }
}

/// Canned-text stand-in for a model session.
#[derive(Debug, Default)]
pub struct FallbackResponder;

impl FallbackResponder {
    pub fn new() -> Self {
        info!("Using fallback responder, no model will be loaded");
        Self
    }

    /// Reply for `prompt` from the keyword table, echoing it when nothing matches.
    pub fn respond(&self, prompt: &str) -> String {
        let lower = prompt.to_lowercase();
        RULES
            .iter()
            .find(|(rule, _)| rule.matches(&lower))
            .map(|(_, reply)| reply.to_string())
            .unwrap_or_else(|| {
                format!(
                    "I understand you're asking about: {prompt}. I'm running in fallback mode, \
                     but I'll do my best to help. Could you tell me more?"
                )
            })
    }
}

impl HostBridge for FallbackResponder {
    fn backend_name(&self) -> &str {
        "fallback"
    }

    fn load(&self, path: &str, context_size: i32) -> bool {
        debug!("Fallback load ignored: {} (context {})", path, context_size);
        true
    }

    fn generate(&self, prompt: Option<&str>, _max_tokens: i32) -> String {
        match prompt {
            Some(prompt) if !prompt.is_empty() => self.respond(prompt),
            _ => error_marker(&SessionError::InvalidInput("prompt is empty".to_string())),
        }
    }

    fn generate_with_image(&self, _prompt: Option<&str>, _image: &[u8], _max_tokens: i32) -> String {
        IMAGE_REPLY.to_string()
    }

    fn embed(&self, prompt: Option<&str>) -> Option<Vec<f32>> {
        prompt.map(|_| vec![0.0; FALLBACK_EMBEDDING_SIZE])
    }

    fn free(&self) {
        debug!("Fallback free ignored");
    }

    fn is_loaded(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::is_error_marker;

    #[test]
    fn test_keyword_rules() {
        let responder = FallbackResponder::new();
        assert!(responder.respond("Hello there").starts_with("Hello!"));
        assert!(responder.respond("How are you today?").contains("doing great"));
        assert!(responder.respond("what's the weather like").contains("weather"));
        assert!(responder.respond("what TIME is it").contains("clock"));
        assert!(responder.respond("can you help me").contains("here to help"));
        assert!(responder.respond("what is your name").contains("fallback mode"));
    }

    #[test]
    fn test_greeting_matches_whole_words_only() {
        let responder = FallbackResponder::new();
        assert!(!responder.respond("this is something").starts_with("Hello!"));
        assert!(responder.respond("hi!").starts_with("Hello!"));
    }

    #[test]
    fn test_default_echoes_prompt() {
        let responder = FallbackResponder::new();
        let reply = responder.respond("quantum chromodynamics");
        assert!(reply.contains("quantum chromodynamics"));
    }

    #[test]
    fn test_bridge_contract() {
        let responder = FallbackResponder::new();
        assert!(responder.is_loaded());
        assert!(responder.load("/nowhere.gguf", 0));
        responder.free();
        assert!(responder.is_loaded());

        assert!(!is_error_marker(&responder.generate(Some("hello"), 16)));
        assert!(is_error_marker(&responder.generate(None, 16)));
        assert!(is_error_marker(&responder.generate(Some(""), 16)));

        let embedding = responder.embed(Some("hello")).unwrap();
        assert_eq!(embedding.len(), FALLBACK_EMBEDDING_SIZE);
        assert!(embedding.iter().all(|&v| v == 0.0));
        assert_eq!(responder.embed(None), None);

        assert!(responder
            .generate_with_image(Some("what is this"), &[1, 2, 3], 16)
            .contains("image"));
        assert!(responder.stats().is_none());
    }
}
