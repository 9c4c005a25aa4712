//! L2 normalization of pooled vectors.

use crate::error::InferenceError;

use super::pool::PooledVector;

/// A unit-length embedding. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEmbedding(Vec<f32>);

impl NormalizedEmbedding {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Divides a pooled vector by its L2 norm.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorNormalizer;

impl VectorNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Euclidean norm, accumulated in f64 in index order.
    pub fn l2_norm(values: &[f32]) -> f64 {
        values
            .iter()
            .map(|&x| {
                let x = f64::from(x);
                x * x
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Consume a pooled vector and return it scaled to unit length.
    ///
    /// A zero or non-finite norm is a `NumericDegeneracy` error; no NaN or
    /// infinity ever reaches the output.
    pub fn normalize(&self, pooled: PooledVector) -> Result<NormalizedEmbedding, InferenceError> {
        let norm = Self::l2_norm(pooled.as_slice());
        if norm == 0.0 {
            return Err(InferenceError::NumericDegeneracy(format!(
                "cannot normalize zero vector of dimension {}",
                pooled.len()
            )));
        }
        if !norm.is_finite() {
            return Err(InferenceError::NumericDegeneracy(format!(
                "vector norm is not finite ({})",
                norm
            )));
        }

        let values = pooled
            .into_inner()
            .into_iter()
            .map(|x| (f64::from(x) / norm) as f32)
            .collect();
        Ok(NormalizedEmbedding(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm_of(e: &NormalizedEmbedding) -> f64 {
        VectorNormalizer::l2_norm(e.as_slice())
    }

    #[test]
    fn test_normalize_three_four() {
        let e = VectorNormalizer::new()
            .normalize(PooledVector::new(vec![3.0, 4.0]))
            .unwrap();
        assert!((e.as_slice()[0] - 0.6).abs() < 1e-7);
        assert!((e.as_slice()[1] - 0.8).abs() < 1e-7);
        assert_eq!(e.dimension(), 2);
    }

    #[test]
    fn test_unit_norm_for_varied_inputs() {
        let normalizer = VectorNormalizer::new();
        let inputs: Vec<Vec<f32>> = vec![
            vec![1e-20, 0.0, 0.0],
            vec![1e20, -1e20, 3.0],
            (0..1024).map(|i| (i as f32 * 0.37).sin()).collect(),
            vec![-0.5; 1024],
            vec![0.0, 0.0, 7.0],
        ];
        for v in inputs {
            let e = normalizer.normalize(PooledVector::new(v)).unwrap();
            let n = norm_of(&e);
            assert!((n - 1.0).abs() < 1e-6, "norm={}", n);
        }
    }

    #[test]
    fn test_zero_vector_is_numeric_degeneracy() {
        let err = VectorNormalizer::new()
            .normalize(PooledVector::new(vec![0.0; 8]))
            .unwrap_err();
        assert!(matches!(err, InferenceError::NumericDegeneracy(_)));
    }

    #[test]
    fn test_empty_vector_is_numeric_degeneracy() {
        let err = VectorNormalizer::new()
            .normalize(PooledVector::new(vec![]))
            .unwrap_err();
        assert!(matches!(err, InferenceError::NumericDegeneracy(_)));
    }

    #[test]
    fn test_non_finite_input_rejected() {
        let normalizer = VectorNormalizer::new();
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let err = normalizer
                .normalize(PooledVector::new(vec![1.0, bad]))
                .unwrap_err();
            assert!(matches!(err, InferenceError::NumericDegeneracy(_)));
        }
    }

    #[test]
    fn test_normalize_is_bit_reproducible() {
        let v: Vec<f32> = (0..257).map(|i| (i as f32).cos() * 3.3).collect();
        let a = VectorNormalizer::new()
            .normalize(PooledVector::new(v.clone()))
            .unwrap();
        let b = VectorNormalizer::new()
            .normalize(PooledVector::new(v))
            .unwrap();
        let bits_a: Vec<u32> = a.as_slice().iter().map(|x| x.to_bits()).collect();
        let bits_b: Vec<u32> = b.as_slice().iter().map(|x| x.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }
}
