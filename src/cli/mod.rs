//! Shared CLI utilities for the parity binaries.

pub mod backend;
pub mod signal;

use std::path::{Path, PathBuf};

use crate::error::InferenceError;

/// How many parent directories to climb looking for the repository root.
pub const MAX_ROOT_SEARCH_DEPTH: usize = 10;

/// Directory whose presence marks the repository root.
pub const MODELS_DIR: &str = "models";

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Walk up from `start` until a directory containing `models/` is found.
///
/// `start` itself counts as the first level.
pub fn find_repository_root(start: &Path) -> Result<PathBuf, InferenceError> {
    start
        .ancestors()
        .take(MAX_ROOT_SEARCH_DEPTH + 1)
        .find(|dir| dir.join(MODELS_DIR).is_dir())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            InferenceError::InvalidInput(format!(
                "could not find a '{}' directory within {} levels above {}",
                MODELS_DIR,
                MAX_ROOT_SEARCH_DEPTH,
                start.display()
            ))
        })
}

/// `<root>/models/qwen3-embedding/model`
pub fn default_embedding_model_dir(root: &Path) -> PathBuf {
    root.join(MODELS_DIR).join("qwen3-embedding").join("model")
}

/// Where the downstream test suite expects the reference fixture.
pub fn default_reference_output(root: &Path) -> PathBuf {
    root.join("dotnet")
        .join("Qwen3.Onnx.Embedding.Tests")
        .join("TestData")
        .join("reference_embeddings.json")
}

/// Use `explicit` if given, otherwise derive from the repository root.
pub fn resolve_path(
    explicit: Option<PathBuf>,
    derive: impl FnOnce(&Path) -> PathBuf,
) -> Result<PathBuf, InferenceError> {
    match explicit {
        Some(path) => Ok(path),
        None => {
            let cwd = std::env::current_dir()?;
            Ok(derive(&find_repository_root(&cwd)?))
        }
    }
}
