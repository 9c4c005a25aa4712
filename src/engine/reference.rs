//! Reference embedding sets: build, persist, reload, verify.
//!
//! [`ReferenceSetBuilder`] drives each corpus text through the encoder, the
//! last-token pooler and the L2 normalizer, one text at a time and in input
//! order. Any failure aborts the whole build; there is no partial result.
//!
//! The persisted document is a JSON object keyed by the exact input text:
//!
//! ```json
//! {
//!   "What is the capital of France?": {
//!     "embedding": [0.0123, ...],
//!     "dimension": 1024
//!   }
//! }
//! ```
//!
//! Key order follows the corpus. Floats are written as the shortest decimal
//! that round-trips the f32 value widened to f64.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::backend::EncoderClient;
use crate::error::InferenceError;

use super::normalize::{NormalizedEmbedding, VectorNormalizer};
use super::pool::LastTokenPooler;

/// The fixed corpus used to pin down cross-implementation behavior.
///
/// Mixes scripts, special-token markup and near-empty input on purpose.
pub const DEFAULT_CORPUS: &[&str] = &[
    "What is the capital of France?",
    "The quick brown fox jumps over the lazy dog.",
    "Machine learning is a subset of artificial intelligence.",
    "你好，世界！",
    "Привет, мир!",
    "こんにちは世界",
    "مرحبا بالعالم",
    "Hola mundo",
    "Bonjour le monde",
    "Olá mundo",
    "Ciao mondo",
    "Hallo Welt",
    "안녕하세요 세계",
    "<|endoftext|>",
    "<|im_start|>user\nHello<|im_end|>",
    "<|vision_start|><|vision_end|>",
    "<tool_call>function_name</tool_call>",
    "<|fim_prefix|>code before<|fim_suffix|>code after<|fim_middle|>",
    "<|repo_name|>my-repo<|file_sep|>main.py",
    "<think>reasoning process</think>",
    "Empty string test: ",
    "Special chars: @#$%^&*()_+-=[]{}|;':\",./<>?",
    "Numbers: 0123456789",
    "Mixed: Hello世界123!@#",
];

/// Default cosine similarity a fresh embedding must reach against its reference.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9999;

/// One entry of the persisted document.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub embedding: Vec<f32>,
    pub dimension: usize,
}

impl From<NormalizedEmbedding> for EmbeddingRecord {
    fn from(e: NormalizedEmbedding) -> Self {
        let embedding = e.into_inner();
        Self {
            dimension: embedding.len(),
            embedding,
        }
    }
}

impl Serialize for EmbeddingRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let widened: Vec<f64> = self.embedding.iter().map(|&x| f64::from(x)).collect();
        let mut state = serializer.serialize_struct("EmbeddingRecord", 2)?;
        state.serialize_field("embedding", &widened)?;
        state.serialize_field("dimension", &self.dimension)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for EmbeddingRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            embedding: Vec<f64>,
            dimension: usize,
        }

        let raw = Raw::deserialize(deserializer)?;
        Ok(Self {
            embedding: raw.embedding.into_iter().map(|x| x as f32).collect(),
            dimension: raw.dimension,
        })
    }
}

/// Ordered mapping from input text to its embedding record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSet {
    entries: Vec<(String, EmbeddingRecord)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Keys must be unique.
    pub fn insert(&mut self, text: String, record: EmbeddingRecord) -> Result<(), InferenceError> {
        if self.get(&text).is_some() {
            return Err(InferenceError::InvalidInput(format!(
                "duplicate reference text {:?}",
                text
            )));
        }
        self.entries.push((text, record));
        Ok(())
    }

    pub fn get(&self, text: &str) -> Option<&EmbeddingRecord> {
        self.entries
            .iter()
            .find(|(key, _)| key == text)
            .map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EmbeddingRecord)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Dimension of the first entry, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|(_, r)| r.dimension)
    }

    /// Pretty-printed JSON with two-space indentation.
    pub fn to_json(&self) -> Result<String, InferenceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the document to `path`, replacing any previous file.
    ///
    /// The content goes to a sibling temp file first and is renamed into
    /// place, so a failure never leaves a truncated document behind.
    pub fn write(&self, path: &Path) -> Result<(), InferenceError> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let written = fs::File::create(&tmp_path).and_then(|mut f| {
            f.write_all(json.as_bytes())?;
            f.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp_path, path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        info!(path = %path.display(), entries = self.len(), "Wrote reference embeddings");
        Ok(())
    }

    /// Read a document back, preserving key order.
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let content = fs::read_to_string(path).map_err(|e| {
            InferenceError::Reference(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Serialize for ReferenceSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (text, record) in &self.entries {
            map.serialize_entry(text, record)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ReferenceSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = ReferenceSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of text to {embedding, dimension}")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut set = ReferenceSet::new();
                while let Some((text, record)) = access.next_entry::<String, EmbeddingRecord>()? {
                    set.insert(text, record)
                        .map_err(<A::Error as serde::de::Error>::custom)?;
                }
                Ok(set)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Drives texts through encode → pool → normalize.
pub struct ReferenceSetBuilder<'a, E: EncoderClient + ?Sized> {
    encoder: &'a mut E,
    pooler: LastTokenPooler,
    normalizer: VectorNormalizer,
}

impl<'a, E: EncoderClient + ?Sized> ReferenceSetBuilder<'a, E> {
    /// The pooler follows the encoder's padding side.
    pub fn new(encoder: &'a mut E) -> Self {
        let pooler = LastTokenPooler::new(encoder.padding_side());
        Self {
            encoder,
            pooler,
            normalizer: VectorNormalizer::new(),
        }
    }

    /// Produce the normalized embedding for a single text.
    pub fn embed(&mut self, text: &str) -> Result<NormalizedEmbedding, InferenceError> {
        let output = self.encoder.encode(text)?;
        if output.hidden_states.batch_size() != 1 {
            return Err(InferenceError::Encoder(format!(
                "expected a batch of 1, encoder returned {}",
                output.hidden_states.batch_size()
            )));
        }

        let pooled = self
            .pooler
            .pool(&output.hidden_states, &output.attention_mask)?
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::Encoder("encoder returned no sequences".to_string()))?;

        self.normalizer.normalize(pooled)
    }

    /// Embed every text in order and assemble the mapping.
    ///
    /// Duplicate texts are rejected before the encoder is called.
    pub fn build<S: AsRef<str>>(&mut self, texts: &[S]) -> Result<ReferenceSet, InferenceError> {
        self.build_with_progress(texts, |_, _| {})
    }

    /// Like [`build`](Self::build), calling `progress(done_before, total)`
    /// just before each text is encoded.
    pub fn build_with_progress<S, F>(
        &mut self,
        texts: &[S],
        mut progress: F,
    ) -> Result<ReferenceSet, InferenceError>
    where
        S: AsRef<str>,
        F: FnMut(usize, usize),
    {
        for (i, text) in texts.iter().enumerate() {
            let text = text.as_ref();
            if texts[..i].iter().any(|t| t.as_ref() == text) {
                return Err(InferenceError::InvalidInput(format!(
                    "duplicate reference text {:?}",
                    text
                )));
            }
        }

        let total = texts.len();
        let mut set = ReferenceSet::new();
        for (idx, text) in texts.iter().enumerate() {
            let text = text.as_ref();
            progress(idx, total);
            info!("Generating embedding {}/{}...", idx + 1, total);
            let embedding = self.embed(text)?;
            debug!(text, dimension = embedding.dimension(), "Embedded text");
            set.insert(text.to_string(), embedding.into())?;
        }
        Ok(set)
    }
}

/// One reference entry that a fresh set failed to reproduce.
#[derive(Debug, Clone, PartialEq)]
pub enum Mismatch {
    Missing { text: String },
    Dimension { text: String, expected: usize, actual: usize },
    Similarity { text: String, similarity: f64 },
}

/// Outcome of comparing a fresh set against a reference document.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub checked: usize,
    pub threshold: f64,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Cosine similarity with f64 accumulation. Zero-length or zero-norm
/// inputs yield 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Check every reference entry against `fresh`.
pub fn verify_against(
    reference: &ReferenceSet,
    fresh: &ReferenceSet,
    threshold: f64,
) -> VerificationReport {
    let mut mismatches = Vec::new();
    for (text, expected) in reference.iter() {
        let Some(actual) = fresh.get(text) else {
            mismatches.push(Mismatch::Missing {
                text: text.to_string(),
            });
            continue;
        };
        if actual.embedding.len() != expected.dimension {
            mismatches.push(Mismatch::Dimension {
                text: text.to_string(),
                expected: expected.dimension,
                actual: actual.embedding.len(),
            });
            continue;
        }
        let similarity = cosine_similarity(&actual.embedding, &expected.embedding);
        if similarity < threshold {
            mismatches.push(Mismatch::Similarity {
                text: text.to_string(),
                similarity,
            });
        }
    }

    VerificationReport {
        checked: reference.len(),
        threshold,
        mismatches,
    }
}
