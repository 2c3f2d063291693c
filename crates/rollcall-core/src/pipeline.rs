//! Per-probe resolution: match against the gallery, then mark attendance.

use crate::config::Config;
use crate::error::{Result, RollcallError};
use crate::identity::{IdentityId, IdentityStore};
use crate::ledger::{AttendanceLedger, Correction, CorrectionOutcome, RecordOutcome};
use crate::matcher::{Decision, LinearMatcher, Matcher};
use crate::storage::Storage;
use crate::vector::FeatureVector;
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserveDecision {
    /// Matched and this was the identity's first sighting of the day.
    Marked,
    /// Matched, but the identity was already marked today.
    AlreadyMarked,
    Unknown,
}

/// What the caller learns about one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub decision: ObserveDecision,
    pub identity: Option<IdentityId>,
    pub display_name: Option<String>,
    pub confidence: Option<f32>,
    pub distance: f32,
    /// Sightings so far today, for matched probes.
    pub occurrence_count: Option<u32>,
}

/// Running recognition counters since the pipeline was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecognitionStats {
    pub observations: u64,
    pub marked: u64,
    pub already_marked: u64,
    pub unknown: u64,
    pub mean_confidence: f64,
    /// Percentage of observations that matched an identity.
    pub success_rate: f64,
    pub unknown_rate: f64,
}

#[derive(Default)]
struct StatsInner {
    observations: u64,
    marked: u64,
    already_marked: u64,
    unknown: u64,
    confidence_sum: f64,
}

/// Orchestrates the matcher and the ledger for each incoming probe.
pub struct ResolutionPipeline {
    identities: Arc<IdentityStore>,
    ledger: Arc<AttendanceLedger>,
    storage: Arc<dyn Storage>,
    matcher: Box<dyn Matcher>,
    tolerance: f32,
    stats: Mutex<StatsInner>,
}

impl ResolutionPipeline {
    /// `identities` and `ledger` must have been opened over `storage`.
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        identities: Arc<IdentityStore>,
        ledger: Arc<AttendanceLedger>,
    ) -> Self {
        Self::with_matcher(config, storage, identities, ledger, Box::new(LinearMatcher))
    }

    pub fn with_matcher(
        config: &Config,
        storage: Arc<dyn Storage>,
        identities: Arc<IdentityStore>,
        ledger: Arc<AttendanceLedger>,
        matcher: Box<dyn Matcher>,
    ) -> Self {
        Self {
            identities,
            ledger,
            storage,
            matcher,
            tolerance: config.tolerance,
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// Load the identity store and the ledger from `storage` and wire them up.
    pub fn open(config: &Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let identities = Arc::new(IdentityStore::open(config, storage.clone())?);
        let ledger = Arc::new(AttendanceLedger::open(config, storage.clone())?);
        Ok(Self::new(config, storage, identities, ledger))
    }

    pub fn identities(&self) -> &Arc<IdentityStore> {
        &self.identities
    }

    pub fn ledger(&self) -> &Arc<AttendanceLedger> {
        &self.ledger
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Resolve a probe observed now (local wall clock).
    pub fn observe(&self, probe: &FeatureVector) -> Result<Observation> {
        self.observe_at(probe, Local::now().naive_local())
    }

    /// Resolve a probe observed at `at`.
    ///
    /// Matching runs on a gallery snapshot without holding any lock; only the
    /// ledger's check-and-write for the matched (identity, day) is serialized.
    /// A persistence failure is returned as an error, never as Unknown.
    pub fn observe_at(&self, probe: &FeatureVector, at: NaiveDateTime) -> Result<Observation> {
        let gallery = self.identities.list();
        let result = self.matcher.resolve(probe, &gallery, self.tolerance)?;

        let (Decision::Matched, Some(identity)) = (result.decision, result.identity.as_ref()) else {
            tracing::debug!(distance = result.distance, "probe did not match any identity");
            self.count(ObserveDecision::Unknown, 0.0);
            return Ok(Observation {
                decision: ObserveDecision::Unknown,
                identity: None,
                display_name: None,
                confidence: None,
                distance: result.distance,
                occurrence_count: None,
            });
        };

        let display_name = result.display_name.clone().unwrap_or_default();
        let recorded = self.ledger.record(identity, &display_name, at)?;
        let decision = match recorded.outcome {
            RecordOutcome::Created => ObserveDecision::Marked,
            RecordOutcome::Updated => ObserveDecision::AlreadyMarked,
        };

        tracing::debug!(
            identity = %identity,
            distance = result.distance,
            confidence = result.confidence,
            ?decision,
            "probe resolved"
        );
        self.count(decision, result.confidence);

        Ok(Observation {
            decision,
            identity: result.identity,
            display_name: result.display_name,
            confidence: Some(result.confidence),
            distance: result.distance,
            occurrence_count: Some(recorded.event.occurrence_count),
        })
    }

    /// Resolve every probe of one frame; each result stands on its own.
    pub fn observe_batch(&self, probes: &[FeatureVector]) -> Vec<Result<Observation>> {
        let at = Local::now().naive_local();
        probes.iter().map(|p| self.observe_at(p, at)).collect()
    }

    /// Administrative correction. `Some(at)` marks the identity present at
    /// `at`; `None` deletes the day's entry.
    ///
    /// The display name comes from the identity store, or from the existing
    /// entry when the identity has since been removed.
    pub fn correct(
        &self,
        identity_id: &IdentityId,
        day: NaiveDate,
        at: Option<NaiveDateTime>,
    ) -> Result<CorrectionOutcome> {
        let correction = match at {
            None => Correction::Delete,
            Some(at) => {
                let display_name = match self.identities.get(identity_id) {
                    Ok(identity) => identity.display_name.clone(),
                    Err(RollcallError::NotFound(_)) => self
                        .ledger
                        .get(identity_id, day)
                        .map(|e| e.display_name)
                        .ok_or_else(|| RollcallError::NotFound(identity_id.to_string()))?,
                    Err(e) => return Err(e),
                };
                Correction::Mark { at, display_name }
            }
        };
        self.ledger.correct(identity_id, day, correction)
    }

    /// Copy all durable state into a new SQLite file at `dest`.
    ///
    /// Not retried: a failed attempt may leave a partial file behind, which
    /// the next attempt would refuse to overwrite.
    pub fn backup(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(RollcallError::InvalidInput(format!(
                "backup target {} already exists",
                dest.display()
            )));
        }
        self.storage.backup(dest).map_err(|source| {
            tracing::error!(dest = %dest.display(), error = %source, "backup failed");
            RollcallError::Persistence { op: "backup", source }
        })?;
        tracing::info!(
            dest = %dest.display(),
            identities = self.identities.len(),
            events = self.ledger.len(),
            "backup written"
        );
        Ok(())
    }

    pub fn stats(&self) -> RecognitionStats {
        let inner = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let matched = inner.marked + inner.already_marked;
        let pct = |n: u64| {
            if inner.observations == 0 {
                0.0
            } else {
                n as f64 * 100.0 / inner.observations as f64
            }
        };
        RecognitionStats {
            observations: inner.observations,
            marked: inner.marked,
            already_marked: inner.already_marked,
            unknown: inner.unknown,
            mean_confidence: if matched == 0 {
                0.0
            } else {
                inner.confidence_sum / matched as f64
            },
            success_rate: pct(matched),
            unknown_rate: pct(inner.unknown),
        }
    }

    fn count(&self, decision: ObserveDecision, confidence: f32) {
        let mut inner = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        inner.observations += 1;
        match decision {
            ObserveDecision::Marked => inner.marked += 1,
            ObserveDecision::AlreadyMarked => inner.already_marked += 1,
            ObserveDecision::Unknown => inner.unknown += 1,
        }
        if decision != ObserveDecision::Unknown {
            inner.confidence_sum += f64::from(confidence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DateRange;
    use crate::storage::MemoryStorage;

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    fn pipeline() -> (ResolutionPipeline, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let cfg = Config {
            dimension: Some(2),
            retry: crate::config::RetryPolicy { max_attempts: 2, base_backoff_ms: 0 },
            ..Config::default()
        };
        (ResolutionPipeline::open(&cfg, storage.clone()).unwrap(), storage)
    }

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn test_unknown_does_not_touch_ledger() {
        let (p, _) = pipeline();
        p.identities().enroll("alice", vec![fv(&[1.0, 0.0])], None).unwrap();

        let obs = p.observe_at(&fv(&[-1.0, 0.0]), at(9)).unwrap();
        assert_eq!(obs.decision, ObserveDecision::Unknown);
        assert!(obs.identity.is_none());
        assert!(p.ledger().is_empty());
    }

    #[test]
    fn test_marked_then_already_marked() {
        let (p, _) = pipeline();
        let alice = p.identities().enroll("alice", vec![fv(&[1.0, 0.0])], None).unwrap();

        let first = p.observe_at(&fv(&[1.0, 0.0]), at(9)).unwrap();
        assert_eq!(first.decision, ObserveDecision::Marked);
        assert_eq!(first.identity.as_ref(), Some(&alice));
        assert_eq!(first.occurrence_count, Some(1));

        let second = p.observe_at(&fv(&[1.0, 0.0]), at(10)).unwrap();
        assert_eq!(second.decision, ObserveDecision::AlreadyMarked);
        assert_eq!(second.occurrence_count, Some(2));
    }

    #[test]
    fn test_persistence_failure_is_an_error_not_unknown() {
        let (p, storage) = pipeline();
        p.identities().enroll("alice", vec![fv(&[1.0, 0.0])], None).unwrap();

        storage.fail_next_writes(5, true);
        let err = p.observe_at(&fv(&[1.0, 0.0]), at(9)).unwrap_err();
        assert!(matches!(err, RollcallError::Persistence { .. }));
        assert!(p.ledger().is_empty());
        assert_eq!(p.stats().observations, 0);
    }

    #[test]
    fn test_transient_failure_retried_transparently() {
        let (p, storage) = pipeline();
        p.identities().enroll("alice", vec![fv(&[1.0, 0.0])], None).unwrap();

        storage.fail_next_writes(1, true);
        let obs = p.observe_at(&fv(&[1.0, 0.0]), at(9)).unwrap();
        assert_eq!(obs.decision, ObserveDecision::Marked);
    }

    #[test]
    fn test_probe_dimension_mismatch_surfaces() {
        let (p, _) = pipeline();
        p.identities().enroll("alice", vec![fv(&[1.0, 0.0])], None).unwrap();
        let err = p.observe_at(&fv(&[1.0, 0.0, 0.0]), at(9)).unwrap_err();
        assert!(matches!(err, RollcallError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_non_finite_probe_is_rejected_not_unknown() {
        let (p, _) = pipeline();
        p.identities().enroll("alice", vec![fv(&[1.0, 0.0])], None).unwrap();

        let err = p.observe_at(&fv(&[f32::NAN, 0.0]), at(9)).unwrap_err();
        assert!(matches!(err, RollcallError::InvalidInput(_)));
        assert!(p.ledger().is_empty());
        assert_eq!(p.stats().observations, 0);
    }

    #[test]
    fn test_stats() {
        let (p, _) = pipeline();
        p.identities().enroll("alice", vec![fv(&[1.0, 0.0])], None).unwrap();
        p.observe_at(&fv(&[1.0, 0.0]), at(9)).unwrap();
        p.observe_at(&fv(&[1.0, 0.0]), at(10)).unwrap();
        p.observe_at(&fv(&[-1.0, 0.0]), at(11)).unwrap();
        p.observe_at(&fv(&[-1.0, 0.0]), at(12)).unwrap();

        let stats = p.stats();
        assert_eq!(stats.observations, 4);
        assert_eq!(stats.marked, 1);
        assert_eq!(stats.already_marked, 1);
        assert_eq!(stats.unknown, 2);
        assert!((stats.success_rate - 50.0).abs() < 1e-9);
        assert!((stats.mean_confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correct_after_identity_removed_uses_ledger_name() {
        let (p, _) = pipeline();
        let alice = p.identities().enroll("alice", vec![fv(&[1.0, 0.0])], None).unwrap();
        p.observe_at(&fv(&[1.0, 0.0]), at(9)).unwrap();
        p.identities().remove(&alice).unwrap();

        let day = at(9).date();
        let outcome = p.correct(&alice, day, Some(at(8))).unwrap();
        assert_eq!(outcome, CorrectionOutcome::Updated);
        let events: Vec<_> = p.ledger().query(DateRange::day(day)).collect();
        assert_eq!(events[0].display_name, "alice");
        assert_eq!(events[0].first_seen, at(8));

        let stranger = IdentityId::new_v4();
        assert!(matches!(
            p.correct(&stranger, day, Some(at(8))).unwrap_err(),
            RollcallError::NotFound(_)
        ));
    }
}
