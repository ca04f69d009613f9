//! Scripted in-memory runtime for driving a session without model weights.
//!
//! Vocabulary: ids 0..=255 are single bytes, 256 is BOS, 257 is EOS. After
//! the prompt the logits peak on each byte of the scripted reply in turn and
//! then on EOS.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::{
    Batch, ContextParams, InferenceRuntime, ModelConfig, ModelParams, ModelSession, RuntimeError,
    TokenId, TokenizeOutcome,
};
use parking_lot::Mutex;

pub const BOS: TokenId = 256;
pub const EOS: TokenId = 257;
pub const VOCAB_SIZE: usize = 258;
pub const EMBEDDING_SIZE: usize = 8;
pub const IMAGE_POSITIONS: usize = 4;

const PEAK_LOGIT: f32 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    BackendInit,
    BackendShutdown,
    LoadModel(PathBuf),
    CreateContext(usize),
    FreeContext,
    FreeModel,
    Tokenize { capacity: usize },
    ClearKvCache,
    Decode {
        tokens: Vec<TokenId>,
        first_position: usize,
        output: Option<usize>,
    },
    Logits,
    Embeddings,
    IngestImage(usize),
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

#[derive(Debug, Clone)]
pub struct Script {
    pub reply: Vec<u8>,
    /// Fail the n-th decode call after a cache clear (0 = prompt).
    pub fail_decode_at: Option<usize>,
    /// Report no logits once this many tokens have been generated.
    pub drop_logits_at: Option<usize>,
    pub fail_load: bool,
    pub fail_context: bool,
    pub image_input: bool,
    pub no_embeddings: bool,
    /// Whether the runtime advertises embedding output at all.
    pub embedding_output: bool,
    pub max_batch: usize,
    pub decode_delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            reply: b"Hi there".to_vec(),
            fail_decode_at: None,
            drop_logits_at: None,
            fail_load: false,
            fail_context: false,
            image_input: false,
            no_embeddings: false,
            embedding_output: true,
            max_batch: 512,
            decode_delay: None,
        }
    }
}

pub struct ScriptedModel {
    pub path: PathBuf,
}

pub struct ScriptedContext {
    context_size: usize,
    next_position: usize,
    decodes_since_clear: usize,
    prompt_done: bool,
    step: usize,
    logits: Vec<f32>,
    logits_index: Option<usize>,
    hidden: Vec<f32>,
    hidden_index: Option<usize>,
}

pub struct ScriptedRuntime {
    script: Script,
    calls: CallLog,
}

impl ScriptedRuntime {
    pub fn new(script: Script) -> (Self, CallLog) {
        let calls = CallLog::default();
        (
            Self {
                script,
                calls: calls.clone(),
            },
            calls,
        )
    }

    fn log(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn next_logits(&self, step: usize) -> Vec<f32> {
        let target = match self.script.reply.get(step) {
            Some(&byte) => byte as usize,
            None => EOS as usize,
        };
        let mut logits = vec![0.0; VOCAB_SIZE];
        logits[target] = PEAK_LOGIT;
        logits
    }
}

impl InferenceRuntime for ScriptedRuntime {
    type Model = ScriptedModel;
    type Context = ScriptedContext;

    fn name(&self) -> &str {
        "scripted"
    }

    fn backend_init(&mut self) {
        self.log(Call::BackendInit);
    }

    fn backend_shutdown(&mut self) {
        self.log(Call::BackendShutdown);
    }

    fn load_model(&mut self, path: &Path, _params: &ModelParams) -> Result<ScriptedModel, RuntimeError> {
        self.log(Call::LoadModel(path.to_path_buf()));
        if self.script.fail_load {
            return Err(RuntimeError::new("unsupported model format"));
        }
        Ok(ScriptedModel {
            path: path.to_path_buf(),
        })
    }

    fn create_context(
        &mut self,
        _model: &ScriptedModel,
        params: &ContextParams,
    ) -> Result<ScriptedContext, RuntimeError> {
        self.log(Call::CreateContext(params.context_size));
        if self.script.fail_context {
            return Err(RuntimeError::new("out of memory"));
        }
        Ok(ScriptedContext {
            context_size: params.context_size,
            next_position: 0,
            decodes_since_clear: 0,
            prompt_done: false,
            step: 0,
            logits: Vec::new(),
            logits_index: None,
            hidden: Vec::new(),
            hidden_index: None,
        })
    }

    fn free_context(&mut self, _context: ScriptedContext) {
        self.log(Call::FreeContext);
    }

    fn free_model(&mut self, _model: ScriptedModel) {
        self.log(Call::FreeModel);
    }

    fn tokenize(
        &self,
        _model: &ScriptedModel,
        text: &str,
        add_bos: bool,
        out: &mut [TokenId],
    ) -> Result<TokenizeOutcome, RuntimeError> {
        self.log(Call::Tokenize {
            capacity: out.len(),
        });
        let mut ids: Vec<TokenId> = Vec::with_capacity(text.len() + 1);
        if add_bos {
            ids.push(BOS);
        }
        ids.extend(text.bytes().map(TokenId::from));
        if out.len() < ids.len() {
            return Ok(TokenizeOutcome::NeedsCapacity(ids.len()));
        }
        out[..ids.len()].copy_from_slice(&ids);
        Ok(TokenizeOutcome::Written(ids.len()))
    }

    fn token_to_piece(&self, _model: &ScriptedModel, token: TokenId) -> Vec<u8> {
        u8::try_from(token).map(|b| vec![b]).unwrap_or_default()
    }

    fn is_end_of_generation(&self, _model: &ScriptedModel, token: TokenId) -> bool {
        token == EOS
    }

    fn vocab_size(&self, _model: &ScriptedModel) -> usize {
        VOCAB_SIZE
    }

    fn embedding_size(&self, _model: &ScriptedModel) -> usize {
        EMBEDDING_SIZE
    }

    fn max_batch_size(&self, _context: &ScriptedContext) -> usize {
        self.script.max_batch
    }

    fn clear_kv_cache(&mut self, context: &mut ScriptedContext) {
        self.log(Call::ClearKvCache);
        context.next_position = 0;
        context.decodes_since_clear = 0;
        context.prompt_done = false;
        context.step = 0;
        context.logits_index = None;
        context.hidden_index = None;
    }

    fn decode(&mut self, context: &mut ScriptedContext, batch: &Batch) -> Result<(), RuntimeError> {
        let first_position = batch.first_position().unwrap_or(0);
        self.log(Call::Decode {
            tokens: batch.tokens().collect(),
            first_position,
            output: batch.output_index(),
        });
        if let Some(delay) = self.script.decode_delay {
            std::thread::sleep(delay);
        }

        let call_index = context.decodes_since_clear;
        context.decodes_since_clear += 1;
        if self.script.fail_decode_at == Some(call_index) {
            return Err(RuntimeError::new("scripted decode failure"));
        }

        // Embedding calls start at 0 without clearing; treat that as a restart.
        if first_position == 0 {
            context.next_position = 0;
            context.prompt_done = false;
            context.step = 0;
        }
        if first_position != context.next_position {
            return Err(RuntimeError::new(format!(
                "position {} out of order, expected {}",
                first_position, context.next_position
            )));
        }
        if first_position + batch.len() > context.context_size {
            return Err(RuntimeError::new("context overflow"));
        }
        context.next_position += batch.len();

        context.logits_index = batch.output_index();
        if batch.output_index().is_some() {
            if context.prompt_done {
                context.step += 1;
            } else {
                context.prompt_done = true;
            }
            context.logits = self.next_logits(context.step);
        }

        context.hidden_index = batch.last_index();
        let last = batch.tokens().last().unwrap_or(0) as f32;
        context.hidden = (0..EMBEDDING_SIZE).map(|i| last + i as f32).collect();
        Ok(())
    }

    fn logits<'a>(&self, context: &'a ScriptedContext, batch_index: usize) -> Option<&'a [f32]> {
        self.log(Call::Logits);
        if self.script.drop_logits_at == Some(context.step) {
            return None;
        }
        match context.logits_index {
            Some(index) if index == batch_index => Some(&context.logits),
            _ => None,
        }
    }

    fn embeddings<'a>(&self, context: &'a ScriptedContext, batch_index: usize) -> Option<&'a [f32]> {
        self.log(Call::Embeddings);
        if self.script.no_embeddings {
            return None;
        }
        match context.hidden_index {
            Some(index) if index == batch_index => Some(&context.hidden),
            _ => None,
        }
    }

    fn supports_embeddings(&self) -> bool {
        self.script.embedding_output
    }

    fn supports_image_input(&self) -> bool {
        self.script.image_input
    }

    fn ingest_image(
        &mut self,
        context: &mut ScriptedContext,
        image: &[u8],
        position: usize,
    ) -> Result<usize, RuntimeError> {
        self.log(Call::IngestImage(image.len()));
        if !self.script.image_input {
            return Err(RuntimeError::new("no image input"));
        }
        context.next_position = position + IMAGE_POSITIONS;
        context.prompt_done = false;
        Ok(IMAGE_POSITIONS)
    }
}

/// Write a small file carrying the GGUF magic and return its path.
pub fn model_file() -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!(
        "kiln-test-{}-{}.gguf",
        std::process::id(),
        n
    ));
    std::fs::write(&path, b"GGUF\x03\x00\x00\x00scripted").unwrap();
    path
}

pub fn session(script: Script) -> (ModelSession<ScriptedRuntime>, CallLog) {
    let (runtime, calls) = ScriptedRuntime::new(script);
    (ModelSession::new(runtime, ModelConfig::default()), calls)
}

pub fn loaded_session(script: Script) -> (ModelSession<ScriptedRuntime>, CallLog, PathBuf) {
    let (session, calls) = session(script);
    let path = model_file();
    session.load(&path, 2048).unwrap();
    calls.lock().clear();
    (session, calls, path)
}

pub fn decodes(calls: &CallLog) -> Vec<Call> {
    calls
        .lock()
        .iter()
        .filter(|c| matches!(c, Call::Decode { .. }))
        .cloned()
        .collect()
}
