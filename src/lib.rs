pub mod error;
pub mod tensor;
pub mod backend;
pub mod engine;
pub mod cli;

pub use error::InferenceError;
pub use tensor::{AttentionMask, HiddenStateBatch, PaddingSide};
pub use backend::{
    EmbeddingOptions, EncoderClient, ExecutionProvider, GenerationEngineClient, SearchOptions,
    TokenDecoder,
};
pub use engine::{ChatLoop, LastTokenPooler, ReferenceSet, ReferenceSetBuilder, VectorNormalizer};
