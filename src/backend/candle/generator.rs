use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen3::ModelForCausalLM;
use tokenizers::Tokenizer;
use tracing::{debug, info, trace};

use crate::backend::{ExecutionProvider, GenerationEngineClient, SearchOptions, Step, TokenDecoder};
use crate::engine::sampler::Sampler;
use crate::error::InferenceError;

use super::{find_safetensor_files, load_config, load_tokenizer, select_device};

/// Tokens that end an assistant turn.
const STOP_TOKENS: &[&str] = &["<|im_end|>", "<|endoftext|>"];

fn generation_err(context: &str) -> impl Fn(candle_core::Error) -> InferenceError + '_ {
    move |e| InferenceError::Generation(format!("{}: {}", context, e))
}

/// Qwen3 causal LM with a KV cache, sampled one token per step.
pub struct Qwen3Generator {
    model: ModelForCausalLM,
    tokenizer: Tokenizer,
    device: Device,
    stop_ids: Vec<u32>,
}

/// State of one generation turn.
pub struct Qwen3Session {
    sampler: Sampler,
    /// Logits for the next position, from the latest forward pass.
    next_logits: Vec<f32>,
    /// Prompt plus generated tokens so far.
    length: usize,
    max_length: usize,
    done: bool,
}

impl Qwen3Session {
    pub fn length(&self) -> usize {
        self.length
    }
}

impl Qwen3Generator {
    pub fn load(model_dir: &Path, provider: ExecutionProvider) -> Result<Self, InferenceError> {
        let device = select_device(provider)?;
        let config = load_config(model_dir)?;
        let tokenizer = load_tokenizer(model_dir)?;

        let stop_ids: Vec<u32> = STOP_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        if stop_ids.is_empty() {
            return Err(InferenceError::Tokenizer(format!(
                "tokenizer defines none of the stop tokens {:?}",
                STOP_TOKENS
            )));
        }

        let dtype = if device.is_cpu() { DType::F32 } else { DType::BF16 };
        let files = find_safetensor_files(model_dir)?;
        info!(file_count = files.len(), device = ?device, dtype = ?dtype, "Loading generator weights");
        // SAFETY: the weight files are memory-mapped read-only and not modified
        // while the model is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, &device) }
            .map_err(|e| InferenceError::Model(format!("Failed to load safetensors: {}", e)))?;
        let model = ModelForCausalLM::new(&config, vb)
            .map_err(|e| InferenceError::Model(format!("Failed to build Qwen3 model: {}", e)))?;

        info!(
            layers = config.num_hidden_layers,
            vocab = config.vocab_size,
            "Generator ready"
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            stop_ids,
        })
    }

    /// Run `tokens` starting at `offset` and return last-position logits.
    fn forward(&mut self, tokens: &[u32], offset: usize) -> Result<Vec<f32>, InferenceError> {
        let input = Tensor::new(tokens, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(generation_err("Failed to build input tensor"))?;
        let logits = self
            .model
            .forward(&input, offset)
            .map_err(generation_err("Forward pass failed"))?;

        // [1, 1, vocab] -> [vocab]
        logits
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1())
            .map_err(generation_err("Failed to read logits"))
    }
}

impl TokenDecoder for Qwen3Generator {
    fn decode(&self, ids: &[u32]) -> Result<String, InferenceError> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| InferenceError::Tokenizer(format!("Failed to decode: {}", e)))
    }
}

impl GenerationEngineClient for Qwen3Generator {
    type Session = Qwen3Session;

    fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| InferenceError::Tokenizer(format!("Failed to encode: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn start(
        &mut self,
        prompt_tokens: &[u32],
        options: &SearchOptions,
    ) -> Result<Self::Session, InferenceError> {
        if prompt_tokens.is_empty() {
            return Err(InferenceError::InvalidInput("empty prompt".to_string()));
        }
        if prompt_tokens.len() >= options.max_length {
            return Err(InferenceError::InvalidInput(format!(
                "prompt has {} tokens, max_length is {}",
                prompt_tokens.len(),
                options.max_length
            )));
        }

        self.model.clear_kv_cache();
        let next_logits = self.forward(prompt_tokens, 0)?;
        debug!(prompt_tokens = prompt_tokens.len(), "Prefill complete");

        Ok(Qwen3Session {
            sampler: Sampler::new(options.sampling()),
            next_logits,
            length: prompt_tokens.len(),
            max_length: options.max_length,
            done: false,
        })
    }

    fn step(&mut self, session: &mut Self::Session) -> Result<Step, InferenceError> {
        if session.done {
            return Err(InferenceError::Generation(
                "step called after generation finished".to_string(),
            ));
        }

        let token_id = session.sampler.sample(&session.next_logits);
        session.length += 1;
        session.done = self.stop_ids.contains(&token_id) || session.length >= session.max_length;
        trace!(token_id, length = session.length, done = session.done, "Sampled token");

        if !session.done {
            session.next_logits = self.forward(&[token_id], session.length - 1)?;
        }

        Ok(Step {
            token_id,
            is_done: session.done,
        })
    }
}
