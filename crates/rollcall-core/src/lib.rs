//! Identity matching and per-day attendance bookkeeping for rollcall.
//!
//! Takes pre-computed face feature vectors, resolves them against enrolled
//! identities by Euclidean distance, and records each identity's presence at
//! most once per calendar day, safely under concurrent callers.

pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod retry;
pub mod storage;
pub mod vector;

pub use config::{Config, RetryPolicy};
pub use error::{Result, RollcallError, StorageError};
pub use identity::{EnrollRequest, Identity, IdentityId, IdentityStore, Snapshot, ValidationReport};
pub use ledger::{
    AttendanceEvent, AttendanceLedger, Correction, CorrectionOutcome, DateRange, EventSource,
    ExportRow, LedgerSummary, RecordOutcome, Recorded, EXPORT_COLUMNS,
};
pub use matcher::{Decision, LinearMatcher, MatchResult, Matcher};
pub use pipeline::{Observation, ObserveDecision, RecognitionStats, ResolutionPipeline};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use vector::FeatureVector;
