//! candle + tokenizers implementations of the collaborator traits.
//!
//! Both clients load a HuggingFace-style model directory:
//!
//! ```text
//! <dir>/config.json
//! <dir>/tokenizer.json
//! <dir>/model.safetensors | model.safetensors.index.json + shards
//! ```

mod encoder;
mod generator;

pub use encoder::Qwen3Encoder;
pub use generator::{Qwen3Generator, Qwen3Session};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_transformers::models::qwen3::Config as Qwen3Config;
use tokenizers::Tokenizer;
use tracing::info;

use crate::backend::ExecutionProvider;
use crate::error::InferenceError;

/// Map an execution provider onto a candle device.
pub fn select_device(provider: ExecutionProvider) -> Result<Device, InferenceError> {
    match provider {
        ExecutionProvider::Cpu => Ok(Device::Cpu),

        ExecutionProvider::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0)
                    .map_err(|e| InferenceError::Backend(format!("CUDA device init failed: {}", e)))
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(InferenceError::Backend(
                    "CUDA backend not available (compile with --features cuda)".to_string(),
                ))
            }
        }

        ExecutionProvider::Metal => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| InferenceError::Backend(format!("Metal device init failed: {}", e)))
            }
            #[cfg(not(feature = "metal"))]
            {
                Err(InferenceError::Backend(
                    "Metal backend not available (compile with --features metal)".to_string(),
                ))
            }
        }
    }
}

pub(crate) fn load_config(model_dir: &Path) -> Result<Qwen3Config, InferenceError> {
    let path = model_dir.join("config.json");
    let text = std::fs::read_to_string(&path).map_err(|e| {
        InferenceError::Model(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&text)
        .map_err(|e| InferenceError::Model(format!("Failed to parse {}: {}", path.display(), e)))
}

pub(crate) fn load_tokenizer(model_dir: &Path) -> Result<Tokenizer, InferenceError> {
    let path = model_dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&path).map_err(|e| {
        InferenceError::Tokenizer(format!("Failed to load {}: {}", path.display(), e))
    })?;
    info!(path = %path.display(), vocab = tokenizer.get_vocab_size(true), "Loaded tokenizer");
    Ok(tokenizer)
}

/// Locate weight files: every shard named by the index, or the single file.
pub fn find_safetensor_files(model_dir: &Path) -> Result<Vec<PathBuf>, InferenceError> {
    let index_path = model_dir.join("model.safetensors.index.json");

    if index_path.exists() {
        let text = std::fs::read_to_string(&index_path)?;
        let index: serde_json::Value = serde_json::from_str(&text)?;

        let files: BTreeSet<&str> = index
            .get("weight_map")
            .and_then(|v| v.as_object())
            .map(|map| map.values().filter_map(|f| f.as_str()).collect())
            .unwrap_or_default();
        if files.is_empty() {
            return Err(InferenceError::Model(format!(
                "No safetensor files listed in {}",
                index_path.display()
            )));
        }
        return Ok(files.into_iter().map(|f| model_dir.join(f)).collect());
    }

    let single = model_dir.join("model.safetensors");
    if single.exists() {
        Ok(vec![single])
    } else {
        Err(InferenceError::Model(format!(
            "No safetensor files found in {}",
            model_dir.display()
        )))
    }
}
