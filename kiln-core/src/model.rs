//! Model configuration and file checks
//!
//! Handles the load-time settings for a session, verifying model files
//! before they reach the runtime, and fetching them from HuggingFace Hub.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::request::SamplingParams;
use crate::runtime::{ContextParams, ModelParams};

/// Context size used when the caller passes zero or a negative value.
pub const DEFAULT_CONTEXT_SIZE: usize = 2048;

/// GGUF magic: 'GGUF' in little-endian
const GGUF_MAGIC: [u8; 4] = [0x47, 0x47, 0x55, 0x46];

/// Prefix selecting a HuggingFace Hub download instead of a local path.
pub const HUB_PREFIX: &str = "hf://";

/// Configuration for model loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context size used when `load` is given a non-positive size
    pub context_size: usize,
    /// Layers offloaded to an accelerator
    pub gpu_layers: u32,
    /// CPU threads for the forward pass
    pub threads: usize,
    /// Largest batch per decode call
    pub batch_size: usize,
    /// Sampling chain settings applied to every generation
    pub sampling: SamplingParams,
    /// Hex SHA-256 the model file must match, if set
    pub expected_sha256: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            gpu_layers: 99,
            threads: 4,
            batch_size: 512,
            sampling: SamplingParams::default(),
            expected_sha256: None,
        }
    }
}

impl ModelConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config: ModelConfig = serde_json::from_slice(&data)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Context size for a `load` call: positive requests win, anything else
    /// falls back to the configured size.
    pub fn effective_context_size(&self, requested: i32) -> usize {
        if requested > 0 {
            requested as usize
        } else if self.context_size > 0 {
            self.context_size
        } else {
            DEFAULT_CONTEXT_SIZE
        }
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            gpu_layers: self.gpu_layers,
        }
    }

    pub fn context_params(&self, context_size: usize) -> ContextParams {
        ContextParams {
            context_size,
            threads: self.threads.max(1),
            batch_size: self.batch_size.max(1),
        }
    }
}

/// Outcome of [`verify_model_file`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub ok: bool,
    pub message: String,
    pub size_bytes: u64,
}

impl VerificationReport {
    fn failed(message: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            ok: false,
            message: message.into(),
            size_bytes,
        }
    }

    /// Convert a failed report into the load error it stands for.
    pub fn into_result(self) -> Result<u64> {
        if self.ok {
            Ok(self.size_bytes)
        } else {
            Err(SessionError::LoadFailed(self.message))
        }
    }
}

/// Check that `path` is a readable, non-empty GGUF file, and when
/// `expected_sha256` is given, that its contents hash to it.
pub fn verify_model_file(path: &Path, expected_sha256: Option<&str>) -> VerificationReport {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => {
            return VerificationReport::failed(
                format!("model file not found: {}", path.display()),
                0,
            )
        }
    };
    if !metadata.is_file() {
        return VerificationReport::failed(format!("not a regular file: {}", path.display()), 0);
    }
    let size_bytes = metadata.len();
    if size_bytes == 0 {
        return VerificationReport::failed(format!("model file is empty: {}", path.display()), 0);
    }

    let mut magic = [0u8; 4];
    let read = File::open(path).and_then(|mut f| f.read_exact(&mut magic));
    if let Err(e) = read {
        return VerificationReport::failed(
            format!("cannot read model file {}: {}", path.display(), e),
            size_bytes,
        );
    }
    if magic != GGUF_MAGIC {
        return VerificationReport::failed(
            format!("not a GGUF file: {}", path.display()),
            size_bytes,
        );
    }

    if let Some(expected) = expected_sha256 {
        let actual = match sha256_hex(path) {
            Ok(hash) => hash,
            Err(e) => {
                return VerificationReport::failed(
                    format!("cannot hash model file {}: {}", path.display(), e),
                    size_bytes,
                )
            }
        };
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return VerificationReport::failed(
                format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    path.display(),
                    expected.trim(),
                    actual
                ),
                size_bytes,
            );
        }
        debug!("Checksum verified for {}", path.display());
    }

    VerificationReport {
        ok: true,
        message: format!(
            "verified {} ({:.1} MB)",
            path.display(),
            size_bytes as f64 / (1024.0 * 1024.0)
        ),
        size_bytes,
    }
}

/// Lowercase hex SHA-256 of a file, read in a streaming fashion.
pub fn sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Split `hf://owner/repo/path/to/file.gguf` into repo id and file name.
pub fn parse_hub_spec(spec: &str) -> Option<(String, String)> {
    let rest = spec.strip_prefix(HUB_PREFIX)?;
    let mut parts = rest.splitn(3, '/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts.next().filter(|s| !s.is_empty())?;
    let file = parts.next().filter(|s| !s.is_empty())?;
    Some((format!("{owner}/{repo}"), file.to_string()))
}

/// Resolve a model location to a local path, downloading `hf://` specs.
#[cfg(feature = "candle")]
pub fn resolve_model_path(spec: &str) -> anyhow::Result<PathBuf> {
    if spec.starts_with(HUB_PREFIX) {
        fetch_from_hub(spec)
    } else {
        Ok(PathBuf::from(spec))
    }
}

/// Without the hub client only local paths resolve.
#[cfg(not(feature = "candle"))]
pub fn resolve_model_path(spec: &str) -> anyhow::Result<PathBuf> {
    if spec.starts_with(HUB_PREFIX) {
        anyhow::bail!("hub downloads need the `candle` feature: {spec}");
    }
    Ok(PathBuf::from(spec))
}

/// Download a GGUF file (and the repo's tokenizer, if it has one) from the Hub.
#[cfg(feature = "candle")]
pub fn fetch_from_hub(spec: &str) -> anyhow::Result<PathBuf> {
    use hf_hub::{api::sync::Api, Repo, RepoType};
    use tracing::{info, warn};

    let (repo_id, file) = parse_hub_spec(spec)
        .ok_or_else(|| anyhow::anyhow!("expected hf://owner/repo/file, got {spec}"))?;

    info!("Fetching {} from {}", file, repo_id);
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        repo_id.clone(),
        RepoType::Model,
        "main".to_string(),
    ));
    let path = repo.get(&file)?;

    // The candle runtime looks for tokenizer.json next to the weights.
    if let Err(e) = repo.get("tokenizer.json") {
        warn!("No tokenizer.json in {}: {}", repo_id, e);
    }

    info!("Model cached at {}", path.display());
    Ok(path)
}
