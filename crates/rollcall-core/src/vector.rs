//! Distance and confidence primitives over fixed-length feature vectors.

use crate::error::{Result, RollcallError};
use serde::{Deserialize, Serialize};

/// Face feature vector (128-dimensional for the dlib ResNet encoder).
///
/// Immutable once constructed: the values are only reachable through `&[f32]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Little-endian byte encoding used by the SQLite backend.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` if the
    /// blob length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

fn ensure_same_dim(a: &FeatureVector, b: &FeatureVector) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(RollcallError::DimensionMismatch {
            expected: a.dim(),
            got: b.dim(),
        });
    }
    Ok(())
}

/// Euclidean distance between two vectors of equal length.
pub fn distance(a: &FeatureVector, b: &FeatureVector) -> Result<f32> {
    ensure_same_dim(a, b)?;
    Ok(a.values
        .iter()
        .zip(b.values.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Map a distance to a confidence in [0, 1]: `max(0, 1 - distance / tolerance)`.
///
/// A non-positive tolerance yields 1.0 only for an exact match.
pub fn confidence(distance: f32, tolerance: f32) -> f32 {
    if tolerance <= 0.0 {
        return if distance <= 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - distance / tolerance).clamp(0.0, 1.0)
}

/// Elementwise mean of a non-empty set of equal-length vectors.
pub fn centroid(vectors: &[FeatureVector]) -> Result<FeatureVector> {
    let first = vectors
        .first()
        .ok_or_else(|| RollcallError::InvalidInput("centroid of an empty vector set".into()))?;

    let mut sum = vec![0.0f32; first.dim()];
    for v in vectors {
        ensure_same_dim(first, v)?;
        for (acc, x) in sum.iter_mut().zip(v.values.iter()) {
            *acc += x;
        }
    }

    let n = vectors.len() as f32;
    Ok(FeatureVector::new(sum.into_iter().map(|s| s / n).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = fv(&[0.1, -0.2, 0.3]);
        assert_eq!(distance(&a, &a.clone()).unwrap(), 0.0);
    }

    #[test]
    fn test_distance_pythagorean() {
        let a = fv(&[0.0, 0.0]);
        let b = fv(&[3.0, 4.0]);
        assert!((distance(&a, &b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let err = distance(&fv(&[1.0, 2.0]), &fv(&[1.0])).unwrap_err();
        assert!(matches!(
            err,
            RollcallError::DimensionMismatch { expected: 2, got: 1 }
        ));
    }

    #[test]
    fn test_confidence_monotonic_and_clamped() {
        assert_eq!(confidence(0.0, 0.4), 1.0);
        assert!((confidence(0.1, 0.4) - 0.75).abs() < 1e-6);
        assert_eq!(confidence(0.4, 0.4), 0.0);
        assert_eq!(confidence(1.2, 0.4), 0.0);
        assert!(confidence(0.1, 0.4) > confidence(0.2, 0.4));
    }

    #[test]
    fn test_confidence_zero_tolerance() {
        assert_eq!(confidence(0.0, 0.0), 1.0);
        assert_eq!(confidence(0.01, 0.0), 0.0);
    }

    #[test]
    fn test_centroid_mean() {
        let c = centroid(&[fv(&[1.0, 0.0]), fv(&[3.0, 2.0])]).unwrap();
        assert_eq!(c.as_slice(), &[2.0, 1.0]);
    }

    #[test]
    fn test_centroid_empty_rejected() {
        assert!(matches!(
            centroid(&[]).unwrap_err(),
            RollcallError::InvalidInput(_)
        ));
    }

    #[test]
    fn test_centroid_mixed_dims_rejected() {
        assert!(matches!(
            centroid(&[fv(&[1.0, 0.0]), fv(&[1.0])]).unwrap_err(),
            RollcallError::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn test_le_bytes_blob_length() {
        let v = fv(&[1.5, -2.25, 0.0]);
        assert_eq!(v.to_le_bytes().len(), 12);
        assert_eq!(FeatureVector::from_le_bytes(&v.to_le_bytes()), Some(v));
        assert!(FeatureVector::from_le_bytes(&[0u8; 5]).is_none());
    }
}
