//! Per-day deduplicated attendance records.
//!
//! At most one [`AttendanceEvent`] exists per (identity, calendar day).
//! `record` and `correct` serialize on a lock striped by that key, persist the
//! new event, and only then publish it to the in-memory view.

use crate::config::{Config, RetryPolicy};
use crate::error::{Result, RollcallError};
use crate::identity::IdentityId;
use crate::retry::with_retry;
use crate::storage::Storage;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const LOCK_STRIPES: usize = 64;

/// Column names of [`ExportRow`], in order.
pub const EXPORT_COLUMNS: [&str; 7] = [
    "identity_id",
    "display_name",
    "day",
    "first_seen",
    "last_seen",
    "occurrence_count",
    "source",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Auto,
    Manual,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Auto => "auto",
            EventSource::Manual => "manual",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = RollcallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(EventSource::Auto),
            "manual" => Ok(EventSource::Manual),
            other => Err(RollcallError::InvalidInput(format!("unknown event source {other:?}"))),
        }
    }
}

/// One identity's presence on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity_id: IdentityId,
    /// Display name at the time the event was created.
    pub display_name: String,
    pub day: NaiveDate,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub occurrence_count: u32,
    pub source: EventSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Created,
    Updated,
}

/// Outcome of [`AttendanceLedger::record`] with the event as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub outcome: RecordOutcome,
    pub event: AttendanceEvent,
}

/// Administrative override for one (identity, day) entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    /// Create the entry, or move its first-seen time to `at`.
    Mark { at: NaiveDateTime, display_name: String },
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionOutcome {
    Created,
    Updated,
    Deleted,
}

/// Inclusive range of calendar days. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDateRange")]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Deserialize)]
struct RawDateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = RollcallError;

    fn try_from(raw: RawDateRange) -> Result<Self> {
        DateRange::new(raw.start, raw.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(RollcallError::InvalidInput(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn day(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

/// Flat row handed to export formatters (CSV, spreadsheets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub identity_id: String,
    pub display_name: String,
    pub day: String,
    pub first_seen: String,
    pub last_seen: String,
    pub occurrence_count: u32,
    pub source: String,
}

impl From<&AttendanceEvent> for ExportRow {
    fn from(e: &AttendanceEvent) -> Self {
        Self {
            identity_id: e.identity_id.to_string(),
            display_name: e.display_name.clone(),
            day: e.day.format("%Y-%m-%d").to_string(),
            first_seen: e.first_seen.format("%Y-%m-%dT%H:%M:%S").to_string(),
            last_seen: e.last_seen.format("%Y-%m-%dT%H:%M:%S").to_string(),
            occurrence_count: e.occurrence_count,
            source: e.source.to_string(),
        }
    }
}

/// Aggregate attendance figures over a date range.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub total_events: usize,
    pub unique_attendees: usize,
    /// Days that have at least one event.
    pub days_with_attendance: usize,
    pub average_daily_attendance: f64,
    pub events_per_day: BTreeMap<NaiveDate, usize>,
    /// (identity, display name, days present), most days first.
    pub days_present: Vec<(IdentityId, String, usize)>,
}

type DayEvents = HashMap<IdentityId, AttendanceEvent>;

/// Owns every [`AttendanceEvent`].
pub struct AttendanceLedger {
    events: RwLock<BTreeMap<NaiveDate, DayEvents>>,
    stripes: Vec<Mutex<()>>,
    storage: Arc<dyn Storage>,
    retry: RetryPolicy,
}

impl AttendanceLedger {
    pub fn open(config: &Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let loaded = with_retry(&config.retry, "load_events", || storage.load_events())?;

        let mut events: BTreeMap<NaiveDate, DayEvents> = BTreeMap::new();
        let count = loaded.len();
        for event in loaded {
            events
                .entry(event.day)
                .or_default()
                .insert(event.identity_id.clone(), event);
        }
        tracing::info!(events = count, days = events.len(), "attendance ledger loaded");

        Ok(Self {
            events: RwLock::new(events),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            storage,
            retry: config.retry.clone(),
        })
    }

    /// Record a sighting of `identity_id` at `at`.
    ///
    /// The first sighting of the day creates the event; later ones widen
    /// first/last-seen and bump the occurrence count.
    pub fn record(
        &self,
        identity_id: &IdentityId,
        display_name: &str,
        at: NaiveDateTime,
    ) -> Result<Recorded> {
        let day = at.date();
        let _key = self.lock_key(identity_id, day);

        let (outcome, event) = match self.find(identity_id, day) {
            None => (
                RecordOutcome::Created,
                AttendanceEvent {
                    identity_id: identity_id.clone(),
                    display_name: display_name.to_string(),
                    day,
                    first_seen: at,
                    last_seen: at,
                    occurrence_count: 1,
                    source: EventSource::Auto,
                },
            ),
            Some(mut event) => {
                event.first_seen = event.first_seen.min(at);
                event.last_seen = event.last_seen.max(at);
                event.occurrence_count = event.occurrence_count.saturating_add(1);
                (RecordOutcome::Updated, event)
            }
        };

        with_retry(&self.retry, "record", || self.storage.save_event(&event))?;
        self.publish(event.clone());

        if outcome == RecordOutcome::Created {
            tracing::info!(identity = %identity_id, display_name, %day, "attendance marked");
        } else {
            tracing::debug!(
                identity = %identity_id,
                %day,
                count = event.occurrence_count,
                "attendance already marked"
            );
        }
        Ok(Recorded { outcome, event })
    }

    /// Administrative override. Bypasses the dedup rules and marks the
    /// resulting event as manual.
    pub fn correct(
        &self,
        identity_id: &IdentityId,
        day: NaiveDate,
        correction: Correction,
    ) -> Result<CorrectionOutcome> {
        let _key = self.lock_key(identity_id, day);
        let existing = self.find(identity_id, day);

        match correction {
            Correction::Delete => {
                if existing.is_none() {
                    return Err(RollcallError::NotFound(format!(
                        "no attendance for {identity_id} on {day}"
                    )));
                }
                with_retry(&self.retry, "correct", || {
                    self.storage.delete_event(identity_id, day)
                })?;
                let mut events = self.write_events();
                if let Some(day_events) = events.get_mut(&day) {
                    day_events.remove(identity_id);
                    if day_events.is_empty() {
                        events.remove(&day);
                    }
                }
                tracing::info!(identity = %identity_id, %day, "attendance deleted by correction");
                Ok(CorrectionOutcome::Deleted)
            }
            Correction::Mark { at, display_name } => {
                if at.date() != day {
                    return Err(RollcallError::InvalidInput(format!(
                        "corrected time {at} does not fall on {day}"
                    )));
                }
                let (outcome, event) = match existing {
                    None => (
                        CorrectionOutcome::Created,
                        AttendanceEvent {
                            identity_id: identity_id.clone(),
                            display_name,
                            day,
                            first_seen: at,
                            last_seen: at,
                            occurrence_count: 1,
                            source: EventSource::Manual,
                        },
                    ),
                    Some(mut event) => {
                        event.first_seen = at;
                        event.last_seen = event.last_seen.max(at);
                        event.source = EventSource::Manual;
                        (CorrectionOutcome::Updated, event)
                    }
                };
                with_retry(&self.retry, "correct", || self.storage.save_event(&event))?;
                self.publish(event);
                tracing::info!(identity = %identity_id, %day, ?outcome, "attendance corrected");
                Ok(outcome)
            }
        }
    }

    /// Events within `range`, ordered by day, then display name.
    ///
    /// The events are copied out under the read lock, so the iterator is a
    /// point-in-time snapshot and later writes do not show up in it.
    pub fn query(&self, range: DateRange) -> impl Iterator<Item = AttendanceEvent> {
        let events = self.read_events();
        let mut out: Vec<AttendanceEvent> = events
            .range(range.start..=range.end)
            .flat_map(|(_, day_events)| day_events.values().cloned())
            .collect();
        drop(events);

        out.sort_by(|a, b| {
            a.day
                .cmp(&b.day)
                .then_with(|| a.display_name.cmp(&b.display_name))
                .then_with(|| a.identity_id.cmp(&b.identity_id))
        });
        out.into_iter()
    }

    /// One identity's events within `range`, oldest first.
    pub fn history(&self, identity_id: &IdentityId, range: DateRange) -> Vec<AttendanceEvent> {
        self.read_events()
            .range(range.start..=range.end)
            .filter_map(|(_, day_events)| day_events.get(identity_id).cloned())
            .collect()
    }

    /// Structured rows for an external export formatter.
    pub fn export(&self, range: DateRange) -> Vec<ExportRow> {
        self.query(range).map(|e| ExportRow::from(&e)).collect()
    }

    pub fn summary(&self, range: DateRange) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        let mut per_identity: HashMap<IdentityId, (String, usize)> = HashMap::new();

        for event in self.query(range) {
            summary.total_events += 1;
            *summary.events_per_day.entry(event.day).or_default() += 1;
            per_identity
                .entry(event.identity_id)
                .or_insert_with(|| (event.display_name, 0))
                .1 += 1;
        }

        summary.unique_attendees = per_identity.len();
        summary.days_with_attendance = summary.events_per_day.len();
        if summary.days_with_attendance > 0 {
            summary.average_daily_attendance =
                summary.total_events as f64 / summary.days_with_attendance as f64;
        }
        let mut days_present: Vec<_> = per_identity
            .into_iter()
            .map(|(id, (name, days))| (id, name, days))
            .collect();
        days_present.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.1.cmp(&b.1)));
        summary.days_present = days_present;
        summary
    }

    pub fn get(&self, identity_id: &IdentityId, day: NaiveDate) -> Option<AttendanceEvent> {
        self.find(identity_id, day)
    }

    pub fn len(&self) -> usize {
        self.read_events().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, identity_id: &IdentityId, day: NaiveDate) -> Option<AttendanceEvent> {
        self.read_events()
            .get(&day)
            .and_then(|day_events| day_events.get(identity_id))
            .cloned()
    }

    fn publish(&self, event: AttendanceEvent) {
        self.write_events()
            .entry(event.day)
            .or_default()
            .insert(event.identity_id.clone(), event);
    }

    fn lock_key(&self, identity_id: &IdentityId, day: NaiveDate) -> std::sync::MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        identity_id.hash(&mut hasher);
        day.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_events(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<NaiveDate, DayEvents>> {
        self.events.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_events(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<NaiveDate, DayEvents>> {
        self.events.write().unwrap_or_else(PoisonError::into_inner)
    }
}
