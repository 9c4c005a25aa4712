//! The embedding and chat pipelines.
//!
//! Embedding: [`LastTokenPooler`] -> [`VectorNormalizer`], driven per text by
//! [`ReferenceSetBuilder`].
//!
//! Chat: [`ChatLoop`] feeds generated tokens through [`IncrementalDetokenizer`]
//! and stops early when its [`CancellationToken`] is raised.

pub mod cancel;
pub mod chat;
pub mod detokenize;
pub mod normalize;
pub mod pool;
pub mod reference;
pub mod sampler;

pub use cancel::CancellationToken;
pub use chat::{format_prompt, ChatContext, ChatLoop, ChatState, TurnOutcome, UserInput};
pub use detokenize::IncrementalDetokenizer;
pub use normalize::{NormalizedEmbedding, VectorNormalizer};
pub use pool::{LastTokenPooler, PooledVector};
pub use reference::{
    cosine_similarity, verify_against, EmbeddingRecord, Mismatch, ReferenceSet,
    ReferenceSetBuilder, VerificationReport, DEFAULT_CORPUS, DEFAULT_SIMILARITY_THRESHOLD,
};
pub use sampler::{Sampler, SamplingConfig};
