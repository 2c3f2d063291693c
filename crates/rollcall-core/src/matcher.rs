use crate::error::{Result, RollcallError};
use crate::identity::{IdentityId, Snapshot};
use crate::vector::{self, FeatureVector};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Matched,
    Unknown,
}

/// Result of matching a probe vector against the enrolled gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub decision: Decision,
    /// Matched identity, `None` when the decision is Unknown.
    pub identity: Option<IdentityId>,
    /// Display name of the matched identity, if any.
    pub display_name: Option<String>,
    /// Smallest distance found; infinite when the gallery is empty.
    pub distance: f32,
    /// Confidence of the match in [0, 1]; 0 for Unknown.
    pub confidence: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            decision: Decision::Unknown,
            identity: None,
            display_name: None,
            distance,
            confidence: 0.0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.decision == Decision::Matched
    }
}

/// Strategy for comparing a probe against a gallery snapshot.
///
/// Implementations must return the identity with the smallest distance to
/// any of its references, prefer the earliest-enrolled identity on ties, and
/// report Unknown beyond `tolerance`. A probe with NaN or infinite
/// components is InvalidInput, never Unknown.
pub trait Matcher: Send + Sync {
    fn resolve(&self, probe: &FeatureVector, gallery: &Snapshot, tolerance: f32)
        -> Result<MatchResult>;
}

/// Exhaustive Euclidean matcher. Linear in the total reference count.
pub struct LinearMatcher;

impl Matcher for LinearMatcher {
    fn resolve(
        &self,
        probe: &FeatureVector,
        gallery: &Snapshot,
        tolerance: f32,
    ) -> Result<MatchResult> {
        if !probe.is_finite() {
            return Err(RollcallError::InvalidInput(
                "probe vector has non-finite components".into(),
            ));
        }
        let Some(dim) = gallery.dimension() else {
            return Ok(MatchResult::unknown(f32::INFINITY));
        };
        if probe.dim() != dim {
            return Err(RollcallError::DimensionMismatch {
                expected: dim,
                got: probe.dim(),
            });
        }

        // The snapshot is in enrollment order, so a strict `<` keeps the
        // earliest identity on equal distances.
        let mut best_dist = f32::INFINITY;
        let mut best = None;
        for identity in gallery.iter() {
            let mut own_min = f32::INFINITY;
            for reference in &identity.references {
                own_min = own_min.min(vector::distance(probe, reference)?);
            }
            if own_min < best_dist {
                best_dist = own_min;
                best = Some(identity);
            }
        }

        match best {
            Some(identity) if best_dist <= tolerance => Ok(MatchResult {
                decision: Decision::Matched,
                identity: Some(identity.id.clone()),
                display_name: Some(identity.display_name.clone()),
                distance: best_dist,
                confidence: vector::confidence(best_dist, tolerance),
            }),
            _ => Ok(MatchResult::unknown(best_dist)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity::IdentityStore;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    fn store() -> IdentityStore {
        let cfg = Config { dimension: Some(3), ..Config::default() };
        IdentityStore::open(&cfg, Arc::new(MemoryStorage::new())).unwrap()
    }

    #[test]
    fn test_exact_reference_matches_with_full_confidence() {
        let s = store();
        s.enroll("decoy", vec![fv(&[0.0, 1.0, 0.0])], None).unwrap();
        let alice = s
            .enroll("alice", vec![fv(&[1.0, 0.0, 0.0]), fv(&[0.9, 0.1, 0.0])], None)
            .unwrap();

        let result = LinearMatcher.resolve(&fv(&[0.9, 0.1, 0.0]), &s.list(), 0.4).unwrap();
        assert!(result.is_match());
        assert_eq!(result.identity, Some(alice));
        assert_eq!(result.display_name.as_deref(), Some("alice"));
        assert_eq!(result.distance, 0.0);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_min_over_any_reference_not_centroid() {
        let s = store();
        // alice's centroid is far from the probe, but one of her references is close.
        let alice = s
            .enroll("alice", vec![fv(&[1.0, 0.0, 0.0]), fv(&[-1.0, 0.0, 0.0])], None)
            .unwrap();
        s.enroll("bob", vec![fv(&[0.0, 0.0, 0.5])], None).unwrap();

        let result = LinearMatcher.resolve(&fv(&[0.95, 0.0, 0.0]), &s.list(), 0.4).unwrap();
        assert_eq!(result.identity, Some(alice));
    }

    #[test]
    fn test_beyond_tolerance_is_unknown() {
        let s = store();
        s.enroll("alice", vec![fv(&[1.0, 0.0, 0.0])], None).unwrap();

        let result = LinearMatcher.resolve(&fv(&[0.0, 1.0, 0.0]), &s.list(), 0.4).unwrap();
        assert_eq!(result.decision, Decision::Unknown);
        assert!(result.identity.is_none());
        assert_eq!(result.confidence, 0.0);
        assert!((result.distance - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_tie_prefers_earliest_enrolled() {
        let s = store();
        let first = s.enroll("first", vec![fv(&[1.0, 0.0, 0.0])], None).unwrap();
        s.enroll("second", vec![fv(&[-1.0, 0.0, 0.0])], None).unwrap();

        for _ in 0..10 {
            let result = LinearMatcher.resolve(&fv(&[0.0, 0.0, 0.0]), &s.list(), 1.5).unwrap();
            assert_eq!(result.identity.as_ref(), Some(&first));
        }
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let cfg = Config { dimension: None, ..Config::default() };
        let s = IdentityStore::open(&cfg, Arc::new(MemoryStorage::new())).unwrap();
        let result = LinearMatcher.resolve(&fv(&[1.0]), &s.list(), 0.4).unwrap();
        assert_eq!(result.decision, Decision::Unknown);

        let s = store();
        let result = LinearMatcher.resolve(&fv(&[1.0, 0.0, 0.0]), &s.list(), 0.4).unwrap();
        assert_eq!(result.decision, Decision::Unknown);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_non_finite_probe_is_invalid_input() {
        let s = store();
        s.enroll("alice", vec![fv(&[1.0, 0.0, 0.0])], None).unwrap();

        for probe in [fv(&[f32::NAN, 0.0, 0.0]), fv(&[f32::INFINITY, 0.0, 0.0])] {
            let err = LinearMatcher.resolve(&probe, &s.list(), 0.4).unwrap_err();
            assert!(matches!(err, RollcallError::InvalidInput(_)));
        }

        let empty = store();
        let err = LinearMatcher.resolve(&fv(&[f32::NAN, 0.0, 0.0]), &empty.list(), 0.4).unwrap_err();
        assert!(matches!(err, RollcallError::InvalidInput(_)));
    }

    #[test]
    fn test_probe_dimension_mismatch() {
        let s = store();
        s.enroll("alice", vec![fv(&[1.0, 0.0, 0.0])], None).unwrap();
        let err = LinearMatcher.resolve(&fv(&[1.0, 0.0]), &s.list(), 0.4).unwrap_err();
        assert!(matches!(err, RollcallError::DimensionMismatch { expected: 3, got: 2 }));
    }
}
