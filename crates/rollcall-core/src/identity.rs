//! Enrolled identities and their reference vectors.
//!
//! [`IdentityStore`] is the sole owner and mutator of identities. Readers get
//! an immutable [`Snapshot`]; writers are serialized, persist first, and then
//! publish a fresh snapshot, so a reader never sees a half-updated reference
//! set and a failed write leaves memory untouched.

use crate::config::{Config, RetryPolicy};
use crate::error::{Result, RollcallError};
use crate::retry::with_retry;
use crate::storage::Storage;
use crate::vector::{self, FeatureVector};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Durable identity identifier (a hyphenated UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new_v4() -> Self {
        Self(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    /// Parse a caller-supplied id. Anything that is not a UUID is InvalidInput.
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = uuid::Uuid::parse_str(s.trim())
            .map_err(|e| RollcallError::InvalidInput(format!("malformed identity id {s:?}: {e}")))?;
        Ok(Self(uuid.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    /// Optional external reference code (employee or student number).
    pub external_ref: Option<String>,
    /// Reference vectors in insertion order, oldest first.
    pub references: Vec<FeatureVector>,
    /// Enrollment order; lower enrolled earlier. Used for tie-breaks.
    pub seq: u64,
    pub created_at: NaiveDateTime,
}

/// Input to [`IdentityStore::enroll_batch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub display_name: String,
    pub references: Vec<FeatureVector>,
    #[serde(default)]
    pub external_ref: Option<String>,
}

/// Point-in-time view of every enrolled identity, in enrollment order.
///
/// Cheap to clone and safe to iterate any number of times.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    identities: Arc<Vec<Arc<Identity>>>,
    dimension: Option<usize>,
}

impl Snapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Identity> + '_ {
        self.identities.iter().map(|i| i.as_ref())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// The store's fixed vector dimension at the time of the snapshot.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Total number of reference vectors across all identities.
    pub fn reference_count(&self) -> usize {
        self.identities.iter().map(|i| i.references.len()).sum()
    }
}

/// Integrity report over the enrolled gallery.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub identities: usize,
    pub reference_vectors: usize,
    pub dimension: Option<usize>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

struct StoreState {
    dimension: Option<usize>,
    next_seq: u64,
    by_id: HashMap<IdentityId, Arc<Identity>>,
    snapshot: Snapshot,
}

impl StoreState {
    fn publish(&mut self) {
        let mut all: Vec<Arc<Identity>> = self.by_id.values().cloned().collect();
        all.sort_by_key(|i| i.seq);
        self.snapshot = Snapshot {
            identities: Arc::new(all),
            dimension: self.dimension,
        };
    }
}

/// Owns every [`Identity`] and its reference vectors.
pub struct IdentityStore {
    state: RwLock<StoreState>,
    /// Serializes mutations so each one can persist outside the state lock.
    writer: Mutex<()>,
    storage: Arc<dyn Storage>,
    max_references: usize,
    retry: RetryPolicy,
}

impl IdentityStore {
    /// Load all persisted identities and build the store.
    ///
    /// Fails with InvalidInput if persisted vectors disagree with the
    /// configured dimension or with each other.
    pub fn open(config: &Config, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;

        let loaded = with_retry(&config.retry, "load_identities", || storage.load_identities())?;

        let mut dimension = config.dimension;
        let mut next_seq = 1;
        let mut by_id = HashMap::with_capacity(loaded.len());
        for identity in loaded {
            for r in &identity.references {
                match dimension {
                    Some(d) if d != r.dim() => {
                        return Err(RollcallError::InvalidInput(format!(
                            "persisted identity {} has {}-dim vectors, store expects {d}",
                            identity.id,
                            r.dim()
                        )));
                    }
                    Some(_) => {}
                    None => dimension = Some(r.dim()),
                }
            }
            next_seq = next_seq.max(identity.seq + 1);
            by_id.insert(identity.id.clone(), Arc::new(identity));
        }

        let mut state = StoreState {
            dimension,
            next_seq,
            by_id,
            snapshot: Snapshot::default(),
        };
        state.publish();

        tracing::info!(
            identities = state.snapshot.len(),
            vectors = state.snapshot.reference_count(),
            dimension = ?state.dimension,
            "identity store loaded"
        );

        Ok(Self {
            state: RwLock::new(state),
            writer: Mutex::new(()),
            storage,
            max_references: config.max_references,
            retry: config.retry.clone(),
        })
    }

    /// Enroll a new identity and return its id.
    ///
    /// If more than `max_references` vectors are supplied, only the most
    /// recent ones are kept.
    pub fn enroll(
        &self,
        display_name: &str,
        references: Vec<FeatureVector>,
        external_ref: Option<&str>,
    ) -> Result<IdentityId> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(RollcallError::InvalidInput("display name is empty".into()));
        }
        if references.is_empty() {
            return Err(RollcallError::InvalidInput(format!(
                "no reference vectors supplied for {display_name:?}"
            )));
        }

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let (dimension, seq) = {
            let state = self.read_state();
            (state.dimension, state.next_seq)
        };

        let dim = dimension.unwrap_or_else(|| references[0].dim());
        for r in &references {
            check_vector(r, dim)?;
        }

        let mut references = references;
        if references.len() > self.max_references {
            let excess = references.len() - self.max_references;
            tracing::warn!(
                display_name,
                supplied = references.len(),
                kept = self.max_references,
                "enrollment exceeds max references; keeping the most recent"
            );
            references.drain(..excess);
        }

        let identity = Identity {
            id: IdentityId::new_v4(),
            display_name: display_name.to_string(),
            external_ref: external_ref
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            references,
            seq,
            created_at: Local::now().naive_local(),
        };

        with_retry(&self.retry, "enroll", || self.storage.save_identity(&identity))?;

        let id = identity.id.clone();
        let mut state = self.write_state();
        state.dimension = Some(dim);
        state.next_seq = seq + 1;
        tracing::info!(
            id = %id,
            display_name = %identity.display_name,
            references = identity.references.len(),
            "identity enrolled"
        );
        state.by_id.insert(id.clone(), Arc::new(identity));
        state.publish();
        Ok(id)
    }

    /// Enroll several identities; each request succeeds or fails on its own.
    pub fn enroll_batch(&self, requests: Vec<EnrollRequest>) -> Vec<Result<IdentityId>> {
        requests
            .into_iter()
            .map(|req| {
                let result =
                    self.enroll(&req.display_name, req.references, req.external_ref.as_deref());
                if let Err(e) = &result {
                    tracing::warn!(display_name = %req.display_name, error = %e, "batch enrollment entry rejected");
                }
                result
            })
            .collect()
    }

    /// Append a reference vector, evicting the oldest once the identity
    /// already holds `max_references`.
    pub fn add_reference(&self, id: &IdentityId, vector: FeatureVector) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let (current, dimension) = {
            let state = self.read_state();
            let current = state
                .by_id
                .get(id)
                .cloned()
                .ok_or_else(|| RollcallError::NotFound(id.to_string()))?;
            (current, state.dimension)
        };
        check_vector(&vector, dimension.unwrap_or_else(|| vector.dim()))?;

        let mut updated = Identity::clone(&current);
        while updated.references.len() >= self.max_references {
            updated.references.remove(0);
        }
        updated.references.push(vector);

        self.replace(updated, "add_reference")
    }

    /// Replace an identity's references with their centroid.
    pub fn compact(&self, id: &IdentityId) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.get(id)?;
        if current.references.len() < 2 {
            return Ok(());
        }
        let mut updated = Identity::clone(&current);
        updated.references = vec![vector::centroid(&current.references)?];
        self.replace(updated, "compact")
    }

    /// Delete an identity and all of its reference vectors. Attendance
    /// history is owned by the ledger and is not touched.
    pub fn remove(&self, id: &IdentityId) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.read_state().by_id.contains_key(id) {
            return Err(RollcallError::NotFound(id.to_string()));
        }

        with_retry(&self.retry, "remove", || self.storage.delete_identity(id))?;

        let mut state = self.write_state();
        if let Some(removed) = state.by_id.remove(id) {
            tracing::info!(id = %id, display_name = %removed.display_name, "identity removed");
        }
        state.publish();
        Ok(())
    }

    pub fn get(&self, id: &IdentityId) -> Result<Arc<Identity>> {
        self.read_state()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| RollcallError::NotFound(id.to_string()))
    }

    /// Consistent point-in-time view of all identities, in enrollment order.
    pub fn list(&self) -> Snapshot {
        self.read_state().snapshot.clone()
    }

    pub fn len(&self) -> usize {
        self.read_state().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> Option<usize> {
        self.read_state().dimension
    }

    pub fn max_references(&self) -> usize {
        self.max_references
    }

    /// Check the gallery for malformed or duplicated reference vectors.
    pub fn validate(&self) -> ValidationReport {
        let snapshot = self.list();
        let mut report = ValidationReport {
            valid: true,
            identities: snapshot.len(),
            reference_vectors: snapshot.reference_count(),
            dimension: snapshot.dimension(),
            ..Default::default()
        };

        let mut seen: HashSet<Vec<u32>> = HashSet::new();
        for identity in snapshot.iter() {
            if identity.references.is_empty() {
                report.errors.push(format!("{} has no reference vectors", identity.id));
            }
            for (i, r) in identity.references.iter().enumerate() {
                if let Some(d) = snapshot.dimension() {
                    if r.dim() != d {
                        report.errors.push(format!(
                            "{} reference {i} has dimension {}, expected {d}",
                            identity.id,
                            r.dim()
                        ));
                    }
                }
                if !r.is_finite() {
                    report
                        .errors
                        .push(format!("{} reference {i} has non-finite components", identity.id));
                }
                let bits: Vec<u32> = r.as_slice().iter().map(|v| v.to_bits()).collect();
                if !seen.insert(bits) {
                    report
                        .warnings
                        .push(format!("{} reference {i} duplicates another reference", identity.id));
                }
            }
        }
        report.valid = report.errors.is_empty();
        report
    }

    /// Persist `updated` and publish it in place of the current version.
    /// Caller must hold the writer lock.
    fn replace(&self, updated: Identity, op: &'static str) -> Result<()> {
        with_retry(&self.retry, op, || self.storage.save_identity(&updated))?;

        let mut state = self.write_state();
        tracing::debug!(
            id = %updated.id,
            references = updated.references.len(),
            op,
            "identity updated"
        );
        if state.dimension.is_none() {
            state.dimension = updated.references.first().map(FeatureVector::dim);
        }
        state.by_id.insert(updated.id.clone(), Arc::new(updated));
        state.publish();
        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_vector(v: &FeatureVector, dim: usize) -> Result<()> {
    if v.dim() != dim {
        return Err(RollcallError::InvalidInput(format!(
            "reference vector has dimension {}, store expects {dim}",
            v.dim()
        )));
    }
    if !v.is_finite() {
        return Err(RollcallError::InvalidInput(
            "reference vector has non-finite components".into(),
        ));
    }
    Ok(())
}
