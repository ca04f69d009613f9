//! Candle runtime - quantized GGUF llama models on candle
//!
//! Weights come from a GGUF file via candle-transformers' quantized llama;
//! the vocabulary comes from a `tokenizer.json` stored next to it.
//! The quantized model only exposes logits for the last position of each
//! forward pass, so it has no hidden-state embeddings to hand out.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use tokenizers::decoders::DecoderWrapper;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::batcher::Batch;
use crate::error::RuntimeError;
use crate::runtime::{ContextParams, InferenceRuntime, ModelParams, TokenId, TokenizeOutcome};

/// Special tokens that end a turn in common chat templates.
const END_OF_TURN_TOKENS: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|im_end|>",
    "<end_of_turn>",
];

const BOS_TOKENS: &[&str] = &["<s>", "<|begin_of_text|>", "<bos>"];

/// SentencePiece word-boundary marker.
const SPIECE_UNDERLINE: char = '\u{2581}';

/// Loaded GGUF weights plus vocabulary
pub struct CandleModel {
    path: PathBuf,
    weights: ModelWeights,
    tokenizer: Tokenizer,
    /// Inverse GPT-2 byte table, present for byte-level BPE vocabularies.
    byte_decoder: Option<HashMap<char, u8>>,
    bos_token: Option<u32>,
    eos_tokens: Vec<u32>,
    vocab_size: usize,
    embedding_length: usize,
}

impl CandleModel {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Per-session weights copy holding the key-value cache.
pub struct CandleContext {
    weights: ModelWeights,
    context_size: usize,
    /// Next position the cache expects.
    position: usize,
    logits: Vec<f32>,
    logits_index: Option<usize>,
}

/// [`InferenceRuntime`] backed by candle.
pub struct CandleRuntime {
    device: Device,
    name: String,
}

impl CandleRuntime {
    pub fn new(device: Device) -> Self {
        let name = match &device {
            Device::Cpu => "candle-cpu",
            Device::Cuda(_) => "candle-cuda",
            Device::Metal(_) => "candle-metal",
        }
        .to_string();
        Self { device, name }
    }

    pub fn new_cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// Create with Metal backend (macOS)
    #[cfg(feature = "metal")]
    pub fn new_metal() -> anyhow::Result<Self> {
        Ok(Self::new(Device::new_metal(0)?))
    }

    /// Create with CUDA backend
    #[cfg(feature = "cuda")]
    pub fn new_cuda(device_id: usize) -> anyhow::Result<Self> {
        Ok(Self::new(Device::new_cuda(device_id)?))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn read_model(&self, path: &Path) -> anyhow::Result<CandleModel> {
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| anyhow!("invalid GGUF file {}: {}", path.display(), e))?;

        let arch = metadata_string(&content, "general.architecture")
            .unwrap_or_else(|| "llama".to_string());
        let embedding_length =
            metadata_u32(&content, &format!("{arch}.embedding_length")).unwrap_or(0) as usize;
        let gguf_bos = metadata_u32(&content, "tokenizer.ggml.bos_token_id");
        let gguf_eos = metadata_u32(&content, "tokenizer.ggml.eos_token_id");
        debug!(
            "GGUF {}: {} tensors, arch {}",
            path.display(),
            content.tensor_infos.len(),
            arch
        );

        let tokenizer_path = path.with_file_name("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            anyhow!(
                "failed to load tokenizer {}: {}",
                tokenizer_path.display(),
                e
            )
        })?;

        let weights = ModelWeights::from_gguf(content, &mut file, &self.device)
            .map_err(|e| anyhow!("failed to load weights: {}", e))?;

        let bos_token = gguf_bos.or_else(|| {
            BOS_TOKENS
                .iter()
                .find_map(|t| tokenizer.token_to_id(t))
        });
        let mut eos_tokens: Vec<u32> = END_OF_TURN_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        if let Some(id) = gguf_eos {
            if !eos_tokens.contains(&id) {
                eos_tokens.push(id);
            }
        }
        if eos_tokens.is_empty() {
            bail!("no end-of-sequence token in {}", tokenizer_path.display());
        }

        let byte_decoder = is_byte_level(&tokenizer).then(byte_level_decoder);
        if byte_decoder.is_some() {
            debug!("Byte-level vocabulary, pieces map back to raw bytes");
        }

        Ok(CandleModel {
            path: path.to_path_buf(),
            weights,
            vocab_size: tokenizer.get_vocab_size(true),
            tokenizer,
            byte_decoder,
            bos_token,
            eos_tokens,
            embedding_length,
        })
    }

    fn forward(&self, context: &mut CandleContext, batch: &Batch) -> anyhow::Result<()> {
        let start = batch
            .first_position()
            .ok_or_else(|| anyhow!("empty batch"))?;
        if start + batch.len() > context.context_size {
            bail!(
                "batch ends at position {} beyond context size {}",
                start + batch.len(),
                context.context_size
            );
        }

        check_batch_start(start, context.position)?;

        let ids: Vec<u32> = batch.tokens().map(|t| t as u32).collect();
        let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let logits = context.weights.forward(&input, start)?;
        context.position = start + batch.len();

        context.logits_index = None;
        context.logits.clear();
        if let Some(index) = batch.output_index() {
            if Some(index) != batch.last_index() {
                bail!("logits requested for entry {index}, only the last entry has output");
            }
            context.logits = logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
            context.logits_index = Some(index);
        }
        Ok(())
    }
}

fn metadata_u32(content: &gguf_file::Content, key: &str) -> Option<u32> {
    content.metadata.get(key).and_then(|v| v.to_u32().ok())
}

fn metadata_string(content: &gguf_file::Content, key: &str) -> Option<String> {
    content
        .metadata
        .get(key)
        .and_then(|v| v.to_string().ok())
        .cloned()
}

/// quantized_llama drops its cached keys and values on a pass at position
/// 0; any other start must continue the cached sequence.
fn check_batch_start(start: usize, cached: usize) -> anyhow::Result<()> {
    if start != 0 && start != cached {
        bail!("batch starts at position {start} but the cache holds {cached}");
    }
    Ok(())
}

fn is_byte_level(tokenizer: &Tokenizer) -> bool {
    matches!(tokenizer.get_decoder(), Some(DecoderWrapper::ByteLevel(_)))
}

/// Inverse of the GPT-2 `bytes_to_unicode` table: printable Latin-1 bytes
/// stand for themselves, the rest are shifted to U+0100 onwards in order.
fn byte_level_decoder() -> HashMap<char, u8> {
    let mut table = HashMap::with_capacity(256);
    let mut shifted = 0u32;
    for byte in 0..=255u8 {
        let printable = matches!(byte, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
        let ch = if printable {
            char::from(byte)
        } else {
            let ch = char::from_u32(256 + shifted);
            shifted += 1;
            match ch {
                Some(ch) => ch,
                None => continue,
            }
        };
        table.insert(ch, byte);
    }
    table
}

/// Raw bytes for one vocabulary entry.
fn piece_bytes(
    tokenizer: &Tokenizer,
    byte_decoder: Option<&HashMap<char, u8>>,
    id: u32,
) -> Vec<u8> {
    let Some(piece) = tokenizer.id_to_token(id) else {
        return Vec::new();
    };
    if let Some(byte) = byte_fallback(&piece) {
        return vec![byte];
    }
    if let Some(table) = byte_decoder {
        let mut bytes = Vec::with_capacity(piece.len());
        for ch in piece.chars() {
            match table.get(&ch) {
                Some(&byte) => bytes.push(byte),
                // Added tokens are stored as plain text.
                None => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        return bytes;
    }
    if piece.contains(SPIECE_UNDERLINE) {
        return piece.replace(SPIECE_UNDERLINE, " ").into_bytes();
    }
    tokenizer
        .decode(&[id], false)
        .map(String::into_bytes)
        .unwrap_or_default()
}

/// Byte-fallback tokens look like `<0x0A>`.
fn byte_fallback(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(hex, 16).ok()
}

impl InferenceRuntime for CandleRuntime {
    type Model = CandleModel;
    type Context = CandleContext;

    fn name(&self) -> &str {
        &self.name
    }

    fn backend_init(&mut self) {
        info!("Initializing {} backend", self.name);
    }

    fn backend_shutdown(&mut self) {
        info!("Shutting down {} backend", self.name);
    }

    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<CandleModel, RuntimeError> {
        if params.gpu_layers > 0 && matches!(self.device, Device::Cpu) {
            debug!("{} layers requested on GPU, running on CPU", params.gpu_layers);
        }
        Ok(self.read_model(path)?)
    }

    fn create_context(
        &mut self,
        model: &CandleModel,
        params: &ContextParams,
    ) -> Result<CandleContext, RuntimeError> {
        if params.context_size == 0 {
            return Err(RuntimeError::new("context size must be positive"));
        }
        debug!(
            "Creating context: {} positions, {} threads",
            params.context_size, params.threads
        );
        Ok(CandleContext {
            weights: model.weights.clone(),
            context_size: params.context_size,
            position: 0,
            logits: Vec::with_capacity(model.vocab_size),
            logits_index: None,
        })
    }

    fn free_context(&mut self, context: CandleContext) {
        drop(context);
    }

    fn free_model(&mut self, model: CandleModel) {
        debug!("Releasing weights for {}", model.path.display());
        drop(model);
    }

    fn tokenize(
        &self,
        model: &CandleModel,
        text: &str,
        add_bos: bool,
        out: &mut [TokenId],
    ) -> Result<TokenizeOutcome, RuntimeError> {
        let encoding = model
            .tokenizer
            .encode(text, false)
            .map_err(|e| RuntimeError::new(format!("tokenizer error: {e}")))?;

        let mut ids: Vec<TokenId> = Vec::with_capacity(encoding.len() + 1);
        if add_bos {
            if let Some(bos) = model.bos_token {
                ids.push(bos as TokenId);
            }
        }
        ids.extend(encoding.get_ids().iter().map(|&id| id as TokenId));

        if out.len() < ids.len() {
            return Ok(TokenizeOutcome::NeedsCapacity(ids.len()));
        }
        out[..ids.len()].copy_from_slice(&ids);
        Ok(TokenizeOutcome::Written(ids.len()))
    }

    fn token_to_piece(&self, model: &CandleModel, token: TokenId) -> Vec<u8> {
        match u32::try_from(token) {
            Ok(id) => piece_bytes(&model.tokenizer, model.byte_decoder.as_ref(), id),
            Err(_) => Vec::new(),
        }
    }

    fn is_end_of_generation(&self, model: &CandleModel, token: TokenId) -> bool {
        u32::try_from(token)
            .map(|id| model.eos_tokens.contains(&id))
            .unwrap_or(false)
    }

    fn vocab_size(&self, model: &CandleModel) -> usize {
        model.vocab_size
    }

    fn embedding_size(&self, model: &CandleModel) -> usize {
        model.embedding_length
    }

    /// The quantized llama attention mask only covers a multi-token chunk at
    /// position 0, so prompts go in whole.
    fn max_batch_size(&self, context: &CandleContext) -> usize {
        context.context_size
    }

    /// Rewinds the expected position to 0. The key-value tensors themselves
    /// live inside the weights copy and are dropped by the next forward pass
    /// at position 0, which [`decode`](InferenceRuntime::decode) enforces.
    fn clear_kv_cache(&mut self, context: &mut CandleContext) {
        context.position = 0;
        context.logits.clear();
        context.logits_index = None;
    }

    fn decode(&mut self, context: &mut CandleContext, batch: &Batch) -> Result<(), RuntimeError> {
        Ok(self.forward(context, batch)?)
    }

    fn logits<'a>(&self, context: &'a CandleContext, batch_index: usize) -> Option<&'a [f32]> {
        match context.logits_index {
            Some(index) if index == batch_index && !context.logits.is_empty() => {
                Some(&context.logits)
            }
            _ => None,
        }
    }

    fn embeddings<'a>(&self, _context: &'a CandleContext, _batch_index: usize) -> Option<&'a [f32]> {
        None
    }

    fn supports_embeddings(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_fallback_pieces() {
        assert_eq!(byte_fallback("<0x0A>"), Some(b'\n'));
        assert_eq!(byte_fallback("<0xE2>"), Some(0xE2));
        assert_eq!(byte_fallback("<0xZZ>"), None);
        assert_eq!(byte_fallback("hello"), None);
    }

    /// Byte-level BPE vocabulary where "é" (C3 A9) spans two tokens.
    const BYTE_LEVEL_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "ByteLevel", "add_prefix_space": false, "trim_offsets": true, "use_regex": true},
        "post_processor": null,
        "decoder": {"type": "ByteLevel", "add_prefix_space": false, "trim_offsets": true, "use_regex": true},
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": {"h": 0, "i": 1, "\u0120": 2, "\u00c3": 3, "\u00a9": 4},
            "merges": []
        }
    }"#;

    #[test]
    fn test_byte_level_table_covers_every_byte() {
        let table = byte_level_decoder();
        assert_eq!(table.len(), 256);
        assert_eq!(table.get(&'\u{0120}'), Some(&b' '));
        assert_eq!(table.get(&'\u{00C3}'), Some(&0xC3));
        assert_eq!(table.get(&'\u{0100}'), Some(&0x00));
        assert_eq!(table.get(&'a'), Some(&b'a'));
    }

    #[test]
    fn test_byte_level_pieces_join_to_original_bytes() {
        let tokenizer = Tokenizer::from_bytes(BYTE_LEVEL_TOKENIZER.as_bytes()).unwrap();
        assert!(is_byte_level(&tokenizer));
        let table = byte_level_decoder();

        let pieces: Vec<Vec<u8>> = [0, 1, 2, 3, 4]
            .iter()
            .map(|&id| piece_bytes(&tokenizer, Some(&table), id))
            .collect();
        assert_eq!(pieces[3], vec![0xC3]);
        assert_eq!(pieces[4], vec![0xA9]);
        assert_eq!(pieces.concat(), "hi é".as_bytes());

        let encoding = tokenizer.encode("hi é", false).unwrap();
        let joined: Vec<u8> = encoding
            .get_ids()
            .iter()
            .flat_map(|&id| piece_bytes(&tokenizer, Some(&table), id))
            .collect();
        assert_eq!(joined, "hi é".as_bytes());
    }

    #[test]
    fn test_batch_start_follows_cache() {
        assert!(check_batch_start(0, 0).is_ok());
        assert!(check_batch_start(0, 17).is_ok());
        assert!(check_batch_start(17, 17).is_ok());
        assert!(check_batch_start(5, 0).is_err());
        assert!(check_batch_start(16, 17).is_err());
    }

    #[test]
    fn test_runtime_name_follows_device() {
        let runtime = CandleRuntime::new_cpu();
        assert_eq!(runtime.name(), "candle-cpu");
        assert!(!runtime.supports_embeddings());
    }

    #[test]
    fn test_load_rejects_non_gguf() {
        let path = std::env::temp_dir().join(format!("kiln-candle-{}.gguf", std::process::id()));
        std::fs::write(&path, b"not a gguf file").unwrap();

        let mut runtime = CandleRuntime::new_cpu();
        let result = runtime.load_model(&path, &ModelParams { gpu_layers: 0 });
        assert!(result.is_err());

        std::fs::remove_file(path).ok();
    }
}
