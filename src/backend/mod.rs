//! Seams to the external ML collaborators.
//!
//! The pooling and streaming logic in [`crate::engine`] never touches a model
//! directly. It talks to:
//!
//! - [`EncoderClient`]: text → per-token hidden states + attention mask
//! - [`GenerationEngineClient`]: prompt tokens → one sampled token per step
//! - [`TokenDecoder`]: token ids → text
//!
//! A candle + tokenizers implementation of both clients lives in [`candle`]
//! behind the `candle` cargo feature. Without it, [`UnavailableBackend`]
//! stands in so the CLIs still build and report a clear error.

#[cfg(feature = "candle")]
pub mod candle;

use std::fmt;

use crate::error::InferenceError;
use crate::engine::sampler::SamplingConfig;
use crate::tensor::{AttentionMask, HiddenStateBatch, PaddingSide};

/// Execution backend a collaborator runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
    Metal,
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionProvider::Cpu => write!(f, "cpu"),
            ExecutionProvider::Cuda => write!(f, "cuda"),
            ExecutionProvider::Metal => write!(f, "metal"),
        }
    }
}

/// Output of one encoder call: hidden states and the paired mask.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub hidden_states: HiddenStateBatch,
    pub attention_mask: AttentionMask,
}

/// A pretrained encoder, treated as a black box.
pub trait EncoderClient {
    /// Encode one text into a batch of size 1.
    ///
    /// Truncation to the model's maximum length happens inside the client.
    fn encode(&mut self, text: &str) -> Result<EncoderOutput, InferenceError>;

    /// Padding side of the client's tokenizer. Fixed for the client's lifetime.
    fn padding_side(&self) -> PaddingSide;

    /// Width `D` of every hidden-state vector.
    fn hidden_size(&self) -> usize;
}

/// Converts token ids back into text.
pub trait TokenDecoder {
    fn decode(&self, ids: &[u32]) -> Result<String, InferenceError>;
}

/// Encoder-side configuration, fixed when the client is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingOptions {
    /// Inputs longer than this many tokens are truncated.
    pub max_length: usize,
    pub padding_side: PaddingSide,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            max_length: 8192,
            padding_side: PaddingSide::Left,
        }
    }
}

/// Per-turn generation profile.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// Cap on prompt + generated tokens.
    pub max_length: usize,
    /// Sampling sharpness. 0.0 = greedy.
    pub temperature: f32,
    /// Nucleus cutoff. 1.0 = disabled.
    pub top_p: f32,
    /// Candidate cutoff. 0 = disabled.
    pub top_k: usize,
    /// Seed for the sampler RNG.
    pub seed: Option<u64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_length: 2048,
            temperature: 0.6,
            top_p: 0.95,
            top_k: 20,
            seed: None,
        }
    }
}

impl SearchOptions {
    /// Deterministic argmax decoding, used for sanity checks.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            ..Default::default()
        }
    }

    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
        }
    }
}

/// One generation step: the new token and whether the engine is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub token_id: u32,
    /// No further `step` calls are valid once this is set.
    pub is_done: bool,
}

/// An autoregressive generation engine with internal sampling.
pub trait GenerationEngineClient: TokenDecoder {
    /// Per-prompt generation state.
    type Session;

    /// Encode prompt text to token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError>;

    /// Feed prompt tokens and configure sampling for a new turn.
    fn start(
        &mut self,
        prompt_tokens: &[u32],
        options: &SearchOptions,
    ) -> Result<Self::Session, InferenceError>;

    /// Produce the next token. Blocks for the duration of one forward pass.
    fn step(&mut self, session: &mut Self::Session) -> Result<Step, InferenceError>;
}

/// Placeholder backend used when no inference backend is compiled in.
///
/// Uninhabited: it can never be constructed, only named.
#[derive(Debug)]
pub enum UnavailableBackend {}

impl EncoderClient for UnavailableBackend {
    fn encode(&mut self, _text: &str) -> Result<EncoderOutput, InferenceError> {
        match *self {}
    }

    fn padding_side(&self) -> PaddingSide {
        match *self {}
    }

    fn hidden_size(&self) -> usize {
        match *self {}
    }
}

impl TokenDecoder for UnavailableBackend {
    fn decode(&self, _ids: &[u32]) -> Result<String, InferenceError> {
        match *self {}
    }
}

impl GenerationEngineClient for UnavailableBackend {
    type Session = ();

    fn encode(&self, _text: &str) -> Result<Vec<u32>, InferenceError> {
        match *self {}
    }

    fn start(
        &mut self,
        _prompt_tokens: &[u32],
        _options: &SearchOptions,
    ) -> Result<Self::Session, InferenceError> {
        match *self {}
    }

    fn step(&mut self, _session: &mut Self::Session) -> Result<Step, InferenceError> {
        match *self {}
    }
}
