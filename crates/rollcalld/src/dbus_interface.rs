use crate::service::{CoreHandle, ServiceError};
use chrono::{NaiveDate, NaiveTime};
use rollcall_core::{DateRange, FeatureVector, Identity, IdentityId, RollcallError};
use serde::Serialize;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// Identity as listed to clients; reference vectors stay in the daemon.
#[derive(Serialize)]
struct IdentitySummary<'a> {
    id: &'a IdentityId,
    display_name: &'a str,
    external_ref: Option<&'a str>,
    references: usize,
    created_at: String,
}

impl<'a> From<&'a Identity> for IdentitySummary<'a> {
    fn from(i: &'a Identity) -> Self {
        Self {
            id: &i.id,
            display_name: &i.display_name,
            external_ref: i.external_ref.as_deref(),
            references: i.references.len(),
            created_at: i.created_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }
}

/// D-Bus interface for the rollcall daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
///
/// Vectors travel as `ad`; structured results as JSON strings. Core error
/// kinds map to distinct D-Bus errors so that a storage failure can never be
/// mistaken for an Unknown decision.
pub struct RollcallService {
    core: CoreHandle,
    db_path: String,
}

impl RollcallService {
    pub fn new(core: CoreHandle, db_path: String) -> Self {
        Self { core, db_path }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Enroll a new identity from pre-computed reference vectors. Returns its id.
    async fn enroll(
        &self,
        display_name: &str,
        external_ref: &str,
        references: Vec<Vec<f64>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(display_name, references = references.len(), "enroll requested");
        let display_name = display_name.to_string();
        let external_ref = Some(external_ref.to_string()).filter(|s| !s.is_empty());
        let references = references.into_iter().map(to_vector).collect();
        let id = self
            .core
            .run("enroll", move |p| {
                p.identities()
                    .enroll(&display_name, references, external_ref.as_deref())
            })
            .await
            .map_err(to_fdo)?;
        Ok(id.to_string())
    }

    /// Append a reference vector to an identity (oldest evicted at the cap).
    async fn add_reference(&self, id: &str, vector: Vec<f64>) -> zbus::fdo::Result<()> {
        let id = parse_id(id)?;
        let vector = to_vector(vector);
        self.core
            .run("add_reference", move |p| p.identities().add_reference(&id, vector))
            .await
            .map_err(to_fdo)
    }

    /// Remove an identity and its reference vectors. Attendance history is kept.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(id, "remove requested");
        let id = parse_id(id)?;
        self.core
            .run("remove", move |p| p.identities().remove(&id))
            .await
            .map_err(to_fdo)
    }

    /// Replace an identity's reference vectors with their centroid.
    async fn compact(&self, id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(id, "compact requested");
        let id = parse_id(id)?;
        self.core
            .run("compact", move |p| p.identities().compact(&id))
            .await
            .map_err(to_fdo)
    }

    /// List enrolled identities as a JSON array.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.core.pipeline().identities().list();
        let rows: Vec<IdentitySummary<'_>> = snapshot.iter().map(IdentitySummary::from).collect();
        to_json(&rows)
    }

    /// One identity as a JSON object.
    async fn get_identity(&self, id: &str) -> zbus::fdo::Result<String> {
        let id = parse_id(id)?;
        let identity = self
            .core
            .pipeline()
            .identities()
            .get(&id)
            .map_err(|e| to_fdo(e.into()))?;
        to_json(&IdentitySummary::from(identity.as_ref()))
    }

    /// Resolve a probe vector observed now and mark attendance on a match.
    async fn observe(&self, probe: Vec<f64>) -> zbus::fdo::Result<String> {
        let probe = to_vector(probe);
        let observation = self
            .core
            .run("observe", move |p| p.observe(&probe))
            .await
            .map_err(to_fdo)?;
        to_json(&observation)
    }

    /// Attendance events between two `YYYY-MM-DD` days (inclusive) as JSON.
    async fn query(&self, start: &str, end: &str) -> zbus::fdo::Result<String> {
        let range = parse_range(start, end)?;
        let events: Vec<_> = self.core.pipeline().ledger().query(range).collect();
        to_json(&events)
    }

    /// One identity's attendance between two days as JSON, oldest first.
    /// Works for removed identities too.
    async fn history(&self, id: &str, start: &str, end: &str) -> zbus::fdo::Result<String> {
        let id = parse_id(id)?;
        let range = parse_range(start, end)?;
        to_json(&self.core.pipeline().ledger().history(&id, range))
    }

    /// Export rows between two days as JSON `{columns, rows}`.
    async fn export(&self, start: &str, end: &str) -> zbus::fdo::Result<String> {
        let range = parse_range(start, end)?;
        let rows = self.core.pipeline().ledger().export(range);
        to_json(&serde_json::json!({
            "columns": rollcall_core::EXPORT_COLUMNS,
            "rows": rows,
        }))
    }

    /// Administrative correction. An empty `time` deletes the day's entry;
    /// otherwise `HH:MM[:SS]` marks the identity present at that time.
    async fn correct(&self, id: &str, day: &str, time: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id, day, time, "correction requested");
        let id = parse_id(id)?;
        let day = parse_day(day)?;
        let at = match time.trim() {
            "" => None,
            t => Some(day.and_time(parse_time(t)?)),
        };
        let outcome = self
            .core
            .run("correct", move |p| p.correct(&id, day, at))
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Recognition counters, attendance summary and gallery validation as JSON.
    async fn stats(&self, start: &str, end: &str) -> zbus::fdo::Result<String> {
        let range = parse_range(start, end)?;
        let pipeline = self.core.pipeline();
        to_json(&serde_json::json!({
            "recognition": pipeline.stats(),
            "attendance": pipeline.ledger().summary(range),
            "gallery": pipeline.identities().validate(),
        }))
    }

    /// Copy the database to a new file at `path` (absolute, must not exist).
    /// Returns the path written.
    async fn backup(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "backup requested");
        let dest = parse_backup_path(path)?;
        let written = dest.display().to_string();
        self.core
            .run("backup", move |p| p.backup(&dest))
            .await
            .map_err(to_fdo)?;
        Ok(written)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let pipeline = self.core.pipeline();
        let gallery = pipeline.identities().list();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "database": self.db_path,
            "identities": gallery.len(),
            "reference_vectors": gallery.reference_count(),
            "dimension": gallery.dimension(),
            "max_references": pipeline.identities().max_references(),
            "tolerance": pipeline.tolerance(),
            "events": pipeline.ledger().len(),
        }))
    }
}

fn to_vector(values: Vec<f64>) -> FeatureVector {
    FeatureVector::new(values.into_iter().map(|v| v as f32).collect())
}

fn to_fdo(err: ServiceError) -> zbus::fdo::Error {
    match err {
        ServiceError::Core(e @ RollcallError::InvalidInput(_))
        | ServiceError::Core(e @ RollcallError::DimensionMismatch { .. }) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        ServiceError::Core(e @ RollcallError::NotFound(_)) => {
            zbus::fdo::Error::UnknownObject(e.to_string())
        }
        ServiceError::Core(e @ RollcallError::Persistence { .. }) => {
            tracing::error!(error = %e, "persistence failure surfaced to client");
            zbus::fdo::Error::IOError(e.to_string())
        }
        ServiceError::Worker(msg) => zbus::fdo::Error::Failed(msg),
    }
}

fn invalid(e: RollcallError) -> zbus::fdo::Error {
    to_fdo(ServiceError::Core(e))
}

fn parse_id(s: &str) -> zbus::fdo::Result<IdentityId> {
    IdentityId::parse(s).map_err(invalid)
}

fn parse_day(s: &str) -> zbus::fdo::Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad day {s:?}: {e}")))
}

fn parse_time(s: &str) -> zbus::fdo::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad time {s:?}: {e}")))
}

fn parse_range(start: &str, end: &str) -> zbus::fdo::Result<DateRange> {
    DateRange::new(parse_day(start)?, parse_day(end)?).map_err(invalid)
}

fn parse_backup_path(s: &str) -> zbus::fdo::Result<PathBuf> {
    let path = PathBuf::from(s.trim());
    if !path.is_absolute() {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "backup path {s:?} must be absolute"
        )));
    }
    Ok(path)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("json: {e}")))
}
