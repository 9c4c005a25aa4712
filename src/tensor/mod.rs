//! Encoder output types: per-token hidden states and their attention mask.
//!
//! [`HiddenStateBatch`] stores a `[batch, seq_len, hidden_size]` block of f32
//! values in row-major order. [`AttentionMask`] pairs with it by sequence
//! index, one 0/1 flag per token position.

use std::fmt;
use std::str::FromStr;

use tracing::trace;

use crate::error::InferenceError;

/// Which end of a fixed-width batch the tokenizer fills with padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
pub enum PaddingSide {
    /// Padding goes before the real tokens; the final position is always real.
    #[default]
    Left,
    /// Padding goes after the real tokens.
    Right,
}

impl fmt::Display for PaddingSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaddingSide::Left => write!(f, "left"),
            PaddingSide::Right => write!(f, "right"),
        }
    }
}

impl FromStr for PaddingSide {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(PaddingSide::Left),
            "right" => Ok(PaddingSide::Right),
            other => Err(InferenceError::InvalidInput(format!(
                "Unknown padding side '{}'. Options: left, right",
                other
            ))),
        }
    }
}

/// Hidden states for a batch of equally padded sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct HiddenStateBatch {
    batch_size: usize,
    seq_len: usize,
    hidden_size: usize,
    data: Vec<f32>,
}

impl HiddenStateBatch {
    /// Wrap a flat row-major `[batch, seq_len, hidden]` buffer.
    pub fn new(
        batch_size: usize,
        seq_len: usize,
        hidden_size: usize,
        data: Vec<f32>,
    ) -> Result<Self, InferenceError> {
        let expected = batch_size * seq_len * hidden_size;
        if data.len() != expected {
            return Err(InferenceError::ShapeMismatch {
                expected: vec![batch_size, seq_len, hidden_size],
                actual: vec![data.len()],
            });
        }
        trace!(batch_size, seq_len, hidden_size, "Created hidden state batch");
        Ok(Self {
            batch_size,
            seq_len,
            hidden_size,
            data,
        })
    }

    /// Build from nested `sequence -> token -> vector` data.
    ///
    /// Every sequence must have the same length and every vector the same width.
    pub fn from_sequences(sequences: Vec<Vec<Vec<f32>>>) -> Result<Self, InferenceError> {
        let batch_size = sequences.len();
        let seq_len = sequences.first().map(|s| s.len()).unwrap_or(0);
        let hidden_size = sequences
            .first()
            .and_then(|s| s.first())
            .map(|v| v.len())
            .unwrap_or(0);

        let mut data = Vec::with_capacity(batch_size * seq_len * hidden_size);
        for (b, seq) in sequences.into_iter().enumerate() {
            if seq.len() != seq_len {
                return Err(InferenceError::ShapeMismatch {
                    expected: vec![seq_len],
                    actual: vec![seq.len()],
                });
            }
            for (t, row) in seq.into_iter().enumerate() {
                if row.len() != hidden_size {
                    return Err(InferenceError::InvalidInput(format!(
                        "sequence {} token {} has width {}, expected {}",
                        b,
                        t,
                        row.len(),
                        hidden_size
                    )));
                }
                data.extend(row);
            }
        }

        Self::new(batch_size, seq_len, hidden_size, data)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// `[batch, seq_len, hidden_size]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.batch_size, self.seq_len, self.hidden_size]
    }

    /// The hidden state of token `position` in sequence `sequence`.
    ///
    /// # Panics
    /// Panics if either index is out of range.
    pub fn row(&self, sequence: usize, position: usize) -> &[f32] {
        assert!(
            sequence < self.batch_size && position < self.seq_len,
            "row ({}, {}) out of range for shape {:?}",
            sequence,
            position,
            self.shape()
        );
        let start = (sequence * self.seq_len + position) * self.hidden_size;
        &self.data[start..start + self.hidden_size]
    }
}

/// Per-sequence 0/1 flags marking real tokens (1) and padding (0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMask {
    rows: Vec<Vec<u8>>,
}

impl AttentionMask {
    /// Wrap per-sequence flag rows. All rows must share one length and hold
    /// only 0 or 1.
    pub fn new(rows: Vec<Vec<u8>>) -> Result<Self, InferenceError> {
        if let Some(first) = rows.first() {
            let len = first.len();
            for (i, row) in rows.iter().enumerate() {
                if row.len() != len {
                    return Err(InferenceError::InvalidInput(format!(
                        "attention mask row {} has length {}, expected {}",
                        i,
                        row.len(),
                        len
                    )));
                }
                if let Some(&bad) = row.iter().find(|&&f| f > 1) {
                    return Err(InferenceError::InvalidInput(format!(
                        "attention mask row {} contains flag {}, expected 0 or 1",
                        i, bad
                    )));
                }
            }
        }
        Ok(Self { rows })
    }

    /// Build a padded mask for sequences of the given real lengths.
    ///
    /// The mask width is the longest length; shorter sequences get zeros on
    /// `side`.
    pub fn from_lengths(lengths: &[usize], side: PaddingSide) -> Self {
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        let rows = lengths
            .iter()
            .map(|&real_len| {
                let mut row = Vec::with_capacity(max_len);
                match side {
                    PaddingSide::Left => {
                        row.resize(max_len - real_len, 0u8);
                        row.resize(max_len, 1u8);
                    }
                    PaddingSide::Right => {
                        row.resize(real_len, 1u8);
                        row.resize(max_len, 0u8);
                    }
                }
                row
            })
            .collect();
        Self { rows }
    }

    pub fn batch_size(&self) -> usize {
        self.rows.len()
    }

    /// Token positions per sequence (0 for an empty batch).
    pub fn seq_len(&self) -> usize {
        self.rows.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn row(&self, sequence: usize) -> &[u8] {
        &self.rows[sequence]
    }

    /// Number of real (non-padding) tokens in `sequence`.
    pub fn real_token_count(&self, sequence: usize) -> usize {
        self.rows[sequence].iter().map(|&f| f as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_hidden_state_batch() {
        let batch = HiddenStateBatch::new(1, 2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(batch.shape(), [1, 2, 3]);
        assert_eq!(batch.row(0, 1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_new_hidden_state_batch_len_mismatch() {
        let err = HiddenStateBatch::new(1, 2, 3, vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_sequences_row_order() {
        let batch = HiddenStateBatch::from_sequences(vec![
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            vec![vec![5.0, 6.0], vec![7.0, 8.0]],
        ])
        .unwrap();
        assert_eq!(batch.shape(), [2, 2, 2]);
        assert_eq!(batch.row(1, 0), &[5.0, 6.0]);
        assert_eq!(batch.row(0, 1), &[3.0, 4.0]);
    }

    #[test]
    fn test_from_sequences_ragged_rejected() {
        let err = HiddenStateBatch::from_sequences(vec![
            vec![vec![1.0], vec![2.0]],
            vec![vec![3.0]],
        ])
        .unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_sequences_width_mismatch_rejected() {
        let err =
            HiddenStateBatch::from_sequences(vec![vec![vec![1.0, 2.0], vec![3.0]]]).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidInput(_)));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_row_out_of_range() {
        let batch = HiddenStateBatch::new(1, 1, 2, vec![0.0, 0.0]).unwrap();
        batch.row(0, 1);
    }

    #[test]
    fn test_mask_rejects_non_binary_flags() {
        let err = AttentionMask::new(vec![vec![1, 2, 0]]).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidInput(_)));
    }

    #[test]
    fn test_mask_rejects_uneven_rows() {
        let err = AttentionMask::new(vec![vec![1, 1], vec![1]]).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidInput(_)));
    }

    #[test]
    fn test_mask_from_lengths_right() {
        let mask = AttentionMask::from_lengths(&[3, 5], PaddingSide::Right);
        assert_eq!(mask.row(0), &[1, 1, 1, 0, 0]);
        assert_eq!(mask.row(1), &[1, 1, 1, 1, 1]);
        assert_eq!(mask.real_token_count(0), 3);
    }

    #[test]
    fn test_mask_from_lengths_left() {
        let mask = AttentionMask::from_lengths(&[2, 4], PaddingSide::Left);
        assert_eq!(mask.row(0), &[0, 0, 1, 1]);
        assert_eq!(mask.row(1), &[1, 1, 1, 1]);
        assert_eq!(mask.seq_len(), 4);
    }

    #[test]
    fn test_mask_from_lengths_empty() {
        let mask = AttentionMask::from_lengths(&[], PaddingSide::Left);
        assert_eq!(mask.batch_size(), 0);
        assert_eq!(mask.seq_len(), 0);
    }

    #[test]
    fn test_padding_side_parse_and_display() {
        assert_eq!("LEFT".parse::<PaddingSide>().unwrap(), PaddingSide::Left);
        assert_eq!("right".parse::<PaddingSide>().unwrap(), PaddingSide::Right);
        assert!("middle".parse::<PaddingSide>().is_err());
        assert_eq!(PaddingSide::Right.to_string(), "right");
        assert_eq!(PaddingSide::default(), PaddingSide::Left);
    }
}
