//! Loading the concrete collaborators behind the `candle` feature.

use std::path::Path;

use crate::backend::{EmbeddingOptions, ExecutionProvider};
use crate::error::InferenceError;

#[cfg(feature = "candle")]
pub type DefaultEncoder = crate::backend::candle::Qwen3Encoder;
#[cfg(not(feature = "candle"))]
pub type DefaultEncoder = crate::backend::UnavailableBackend;

#[cfg(feature = "candle")]
pub type DefaultGenerator = crate::backend::candle::Qwen3Generator;
#[cfg(not(feature = "candle"))]
pub type DefaultGenerator = crate::backend::UnavailableBackend;

/// Fail early with a readable message if `model_dir` is not a directory.
pub fn check_model_dir(model_dir: &Path) -> Result<(), InferenceError> {
    if model_dir.is_dir() {
        Ok(())
    } else {
        Err(InferenceError::Model(format!(
            "Model directory not found: {}",
            model_dir.display()
        )))
    }
}

#[cfg(not(feature = "candle"))]
fn unavailable() -> InferenceError {
    InferenceError::Backend(
        "Inference backend not available (compile with --features candle)".to_string(),
    )
}

/// Load the embedding model for the reference generator.
pub fn load_encoder(
    model_dir: &Path,
    provider: ExecutionProvider,
    options: EmbeddingOptions,
) -> Result<DefaultEncoder, InferenceError> {
    check_model_dir(model_dir)?;
    tracing::info!(model = %model_dir.display(), %provider, "Loading encoder");

    #[cfg(feature = "candle")]
    {
        crate::backend::candle::Qwen3Encoder::load(model_dir, provider, options)
    }
    #[cfg(not(feature = "candle"))]
    {
        let _ = (provider, options);
        Err(unavailable())
    }
}

/// Load the causal LM for the chat session.
pub fn load_generator(
    model_dir: &Path,
    provider: ExecutionProvider,
) -> Result<DefaultGenerator, InferenceError> {
    check_model_dir(model_dir)?;
    tracing::info!(model = %model_dir.display(), %provider, "Loading generator");

    #[cfg(feature = "candle")]
    {
        crate::backend::candle::Qwen3Generator::load(model_dir, provider)
    }
    #[cfg(not(feature = "candle"))]
    {
        let _ = provider;
        Err(unavailable())
    }
}
