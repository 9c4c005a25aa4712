//! Last-token pooling: one hidden-state vector per sequence.
//!
//! With left padding the final position of every sequence is a real token,
//! so the last row is taken unconditionally. With right padding the last real
//! token sits at `sum(mask) - 1`, computed independently per sequence.
//!
//! The right-padding rule is not exercised by the default reference corpus
//! (the embedding tokenizer pads on the left), so parity for it with other
//! implementations is assumed rather than verified.
//!
//! Left padding is also stricter than "take the last position": a left-padded
//! row whose final flag is 0 is rejected with `InvalidInput` instead of being
//! pooled at a padding position. Implementations that infer the padding side
//! from the mask would pool such a row at `sum(mask) - 1`.

use tracing::trace;

use crate::error::InferenceError;
use crate::tensor::{AttentionMask, HiddenStateBatch, PaddingSide};

/// Hidden state of one sequence's final real token, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledVector(Vec<f32>);

impl PooledVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Selects the last real token's hidden state for each sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastTokenPooler {
    padding_side: PaddingSide,
}

impl LastTokenPooler {
    pub fn new(padding_side: PaddingSide) -> Self {
        Self { padding_side }
    }

    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }

    /// Position of the last real token in one mask row.
    ///
    /// Fails with `InvalidInput` for an all-padding (or empty) row, and for a
    /// left-padded row whose final flag is padding.
    pub fn select_index(&self, mask_row: &[u8]) -> Result<usize, InferenceError> {
        let real_tokens: usize = mask_row.iter().map(|&f| f as usize).sum();
        if real_tokens == 0 {
            return Err(InferenceError::InvalidInput(format!(
                "attention mask of length {} has no real tokens",
                mask_row.len()
            )));
        }

        match self.padding_side {
            PaddingSide::Left => {
                let last = mask_row.len() - 1;
                if mask_row[last] != 1 {
                    return Err(InferenceError::InvalidInput(
                        "left-padded sequence ends with a padding position".to_string(),
                    ));
                }
                Ok(last)
            }
            PaddingSide::Right => Ok(real_tokens - 1),
        }
    }

    /// Pool every sequence of the batch.
    pub fn pool(
        &self,
        hidden: &HiddenStateBatch,
        mask: &AttentionMask,
    ) -> Result<Vec<PooledVector>, InferenceError> {
        if hidden.batch_size() != mask.batch_size() || hidden.seq_len() != mask.seq_len() {
            return Err(InferenceError::ShapeMismatch {
                expected: vec![hidden.batch_size(), hidden.seq_len()],
                actual: vec![mask.batch_size(), mask.seq_len()],
            });
        }

        (0..hidden.batch_size())
            .map(|seq| {
                let index = self.select_index(mask.row(seq))?;
                trace!(seq, index, side = %self.padding_side, "Selected last token");
                Ok(PooledVector(hidden.row(seq, index).to_vec()))
            })
            .collect()
    }
}
