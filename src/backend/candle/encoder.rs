use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen3::Model;
use tokenizers::{PaddingDirection, PaddingParams, Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::backend::{EmbeddingOptions, EncoderClient, EncoderOutput, ExecutionProvider};
use crate::error::InferenceError;
use crate::tensor::{AttentionMask, HiddenStateBatch, PaddingSide};

use super::{find_safetensor_files, load_config, load_tokenizer, select_device};

fn encoder_err(context: &str) -> impl Fn(candle_core::Error) -> InferenceError + '_ {
    move |e| InferenceError::Encoder(format!("{}: {}", context, e))
}

/// Qwen3 embedding model returning final-layer hidden states.
pub struct Qwen3Encoder {
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
    options: EmbeddingOptions,
    hidden_size: usize,
}

impl Qwen3Encoder {
    pub fn load(
        model_dir: &Path,
        provider: ExecutionProvider,
        options: EmbeddingOptions,
    ) -> Result<Self, InferenceError> {
        let device = select_device(provider)?;
        let config = load_config(model_dir)?;

        let mut tokenizer = load_tokenizer(model_dir)?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: options.max_length,
                ..Default::default()
            }))
            .map_err(|e| InferenceError::Tokenizer(format!("Failed to set truncation: {}", e)))?;
        tokenizer.with_padding(Some(PaddingParams {
            direction: match options.padding_side {
                PaddingSide::Left => PaddingDirection::Left,
                PaddingSide::Right => PaddingDirection::Right,
            },
            ..Default::default()
        }));

        let files = find_safetensor_files(model_dir)?;
        info!(file_count = files.len(), device = ?device, "Loading encoder weights");
        // SAFETY: the weight files are memory-mapped read-only and not modified
        // while the model is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, DType::F32, &device) }
            .map_err(|e| InferenceError::Model(format!("Failed to load safetensors: {}", e)))?;
        // Embedding checkpoints store the bare model without the "model." prefix.
        let vb = if vb.contains_tensor("model.embed_tokens.weight") {
            vb
        } else {
            vb.rename_f(|name: &str| name.strip_prefix("model.").unwrap_or(name).to_string())
        };

        let model = Model::new(&config, vb)
            .map_err(|e| InferenceError::Model(format!("Failed to build Qwen3 model: {}", e)))?;

        info!(
            hidden_size = config.hidden_size,
            layers = config.num_hidden_layers,
            max_length = options.max_length,
            padding = %options.padding_side,
            "Encoder ready"
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            options,
            hidden_size: config.hidden_size,
        })
    }
}

impl EncoderClient for Qwen3Encoder {
    fn encode(&mut self, text: &str) -> Result<EncoderOutput, InferenceError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| InferenceError::Tokenizer(format!("Failed to encode: {}", e)))?;
        let ids = encoding.get_ids();
        if ids.is_empty() {
            return Err(InferenceError::Encoder(format!(
                "text {:?} produced no tokens",
                text
            )));
        }
        let mask: Vec<u8> = encoding
            .get_attention_mask()
            .iter()
            .map(|&flag| u8::from(flag != 0))
            .collect();
        debug!(tokens = ids.len(), "Encoding text");

        let input = Tensor::new(ids, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(encoder_err("Failed to build input tensor"))?;

        self.model.clear_kv_cache();
        let hidden = self
            .model
            .forward(&input, 0)
            .map_err(encoder_err("Forward pass failed"))?;

        // [1, seq, hidden] -> rows
        let rows: Vec<Vec<f32>> = hidden
            .squeeze(0)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec2())
            .map_err(encoder_err("Failed to read hidden states"))?;

        Ok(EncoderOutput {
            hidden_states: HiddenStateBatch::from_sequences(vec![rows])?,
            attention_mask: AttentionMask::new(vec![mask])?,
        })
    }

    fn padding_side(&self) -> PaddingSide {
        self.options.padding_side
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}
