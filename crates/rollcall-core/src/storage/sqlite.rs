//! SQLite persistence via `rusqlite`.
//!
//! Reference vectors are stored as little-endian f32 blobs next to the owning
//! identity id; timestamps and days are ISO-8601 text.

use super::{prepare_backup_target, Storage};
use crate::error::StorageError;
use crate::identity::{Identity, IdentityId};
use crate::ledger::{AttendanceEvent, EventSource};
use crate::vector::FeatureVector;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const SCHEMA_VERSION: i64 = 1;

/// Wait this long on a locked database before SQLite reports BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        tracing::debug!(journal_mode = %mode, "sqlite pragmas applied");
        tracing::info!(path = %path.display(), "opened sqlite storage");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                external_ref TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS reference_vectors (
                identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                vector BLOB NOT NULL,
                PRIMARY KEY (identity_id, position)
            );
            CREATE TABLE IF NOT EXISTS attendance_events (
                identity_id TEXT NOT NULL,
                day TEXT NOT NULL,
                display_name TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                occurrence_count INTEGER NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (identity_id, day)
            );
            CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance_events(day);",
        )?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(StorageError::Corrupt(format!(
                    "unsupported schema version {v}, expected {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_day(s: &str) -> Result<NaiveDate, StorageError> {
    NaiveDate::parse_from_str(s, DAY_FORMAT)
        .map_err(|e| StorageError::Corrupt(format!("bad day {s:?}: {e}")))
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, StorageError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn format_timestamp(t: &NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_id(s: String) -> Result<IdentityId, StorageError> {
    IdentityId::parse(&s).map_err(|e| StorageError::Corrupt(e.to_string()))
}

impl Storage for SqliteStorage {
    fn load_identities(&self) -> Result<Vec<Identity>, StorageError> {
        let conn = self.lock();

        let mut vectors: HashMap<String, Vec<FeatureVector>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT identity_id, vector FROM reference_vectors
                 ORDER BY identity_id, position",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (owner, blob) = row?;
                let vector = FeatureVector::from_le_bytes(&blob).ok_or_else(|| {
                    StorageError::Corrupt(format!("reference vector blob for {owner} has bad length"))
                })?;
                vectors.entry(owner).or_default().push(vector);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, seq, display_name, external_ref, created_at
             FROM identities ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut identities = Vec::new();
        for row in rows {
            let (id, seq, display_name, external_ref, created_at) = row?;
            let references = vectors.remove(&id).unwrap_or_default();
            identities.push(Identity {
                id: parse_id(id)?,
                display_name,
                external_ref,
                references,
                seq: u64::try_from(seq)
                    .map_err(|_| StorageError::Corrupt(format!("negative seq {seq}")))?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(identities)
    }

    fn save_identity(&self, identity: &Identity) -> Result<(), StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO identities (id, seq, display_name, external_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                external_ref = excluded.external_ref",
            params![
                identity.id.as_str(),
                identity.seq as i64,
                identity.display_name,
                identity.external_ref,
                format_timestamp(&identity.created_at),
            ],
        )?;
        tx.execute(
            "DELETE FROM reference_vectors WHERE identity_id = ?1",
            params![identity.id.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO reference_vectors (identity_id, position, vector) VALUES (?1, ?2, ?3)",
            )?;
            for (position, vector) in identity.references.iter().enumerate() {
                stmt.execute(params![
                    identity.id.as_str(),
                    position as i64,
                    vector.to_le_bytes()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_identity(&self, id: &IdentityId) -> Result<(), StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM reference_vectors WHERE identity_id = ?1",
            params![id.as_str()],
        )?;
        tx.execute("DELETE FROM identities WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        Ok(())
    }

    fn load_events(&self) -> Result<Vec<AttendanceEvent>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT identity_id, day, display_name, first_seen, last_seen, occurrence_count, source
             FROM attendance_events ORDER BY day, identity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (identity_id, day, display_name, first_seen, last_seen, occurrence_count, source) =
                row?;
            events.push(AttendanceEvent {
                identity_id: parse_id(identity_id)?,
                display_name,
                day: parse_day(&day)?,
                first_seen: parse_timestamp(&first_seen)?,
                last_seen: parse_timestamp(&last_seen)?,
                occurrence_count,
                source: source
                    .parse::<EventSource>()
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?,
            });
        }
        Ok(events)
    }

    fn save_event(&self, event: &AttendanceEvent) -> Result<(), StorageError> {
        self.lock().execute(
            "INSERT INTO attendance_events
                (identity_id, day, display_name, first_seen, last_seen, occurrence_count, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(identity_id, day) DO UPDATE SET
                display_name = excluded.display_name,
                first_seen = excluded.first_seen,
                last_seen = excluded.last_seen,
                occurrence_count = excluded.occurrence_count,
                source = excluded.source",
            params![
                event.identity_id.as_str(),
                event.day.format(DAY_FORMAT).to_string(),
                event.display_name,
                format_timestamp(&event.first_seen),
                format_timestamp(&event.last_seen),
                event.occurrence_count,
                event.source.as_str(),
            ],
        )?;
        Ok(())
    }

    fn delete_event(&self, identity_id: &IdentityId, day: NaiveDate) -> Result<(), StorageError> {
        self.lock().execute(
            "DELETE FROM attendance_events WHERE identity_id = ?1 AND day = ?2",
            params![identity_id.as_str(), day.format(DAY_FORMAT).to_string()],
        )?;
        Ok(())
    }

    fn backup(&self, dest: &Path) -> Result<(), StorageError> {
        prepare_backup_target(dest)?;
        let target = dest.to_str().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("backup path {} is not valid UTF-8", dest.display()),
            )
        })?;
        // VACUUM INTO reads inside a single transaction, so the copy is consistent.
        self.lock().execute("VACUUM INTO ?1", params![target])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(seq: u64, refs: Vec<Vec<f32>>) -> Identity {
        Identity {
            id: IdentityId::new_v4(),
            display_name: format!("person {seq}"),
            external_ref: Some(format!("EMP-{seq:03}")),
            references: refs.into_iter().map(FeatureVector::new).collect(),
            seq,
            created_at: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_nano_opt(3, 4, 5, 123_456_789)
                .unwrap(),
        }
    }

    #[test]
    fn test_identity_save_replaces_references() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut alice = identity(1, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        storage.save_identity(&alice).unwrap();

        alice.references = vec![FeatureVector::new(vec![0.5, 0.6])];
        storage.save_identity(&alice).unwrap();

        let loaded = storage.load_identities().unwrap();
        assert_eq!(loaded, vec![alice]);
    }

    #[test]
    fn test_identities_load_in_seq_order() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let second = identity(2, vec![vec![1.0]]);
        let first = identity(1, vec![vec![2.0]]);
        storage.save_identity(&second).unwrap();
        storage.save_identity(&first).unwrap();

        let seqs: Vec<u64> = storage.load_identities().unwrap().iter().map(|i| i.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_delete_identity_drops_vectors() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let alice = identity(1, vec![vec![1.0]]);
        storage.save_identity(&alice).unwrap();
        storage.delete_identity(&alice.id).unwrap();
        assert!(storage.load_identities().unwrap().is_empty());

        let count: i64 = storage
            .lock()
            .query_row("SELECT COUNT(*) FROM reference_vectors", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_event_upsert_keeps_one_row() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let mut event = AttendanceEvent {
            identity_id: IdentityId::new_v4(),
            display_name: "alice".into(),
            day,
            first_seen: day.and_hms_opt(9, 0, 0).unwrap(),
            last_seen: day.and_hms_opt(9, 0, 0).unwrap(),
            occurrence_count: 1,
            source: EventSource::Auto,
        };
        storage.save_event(&event).unwrap();
        event.last_seen = day.and_hms_opt(10, 0, 0).unwrap();
        event.occurrence_count = 2;
        storage.save_event(&event).unwrap();

        assert_eq!(storage.load_events().unwrap(), vec![event.clone()]);

        storage.delete_event(&event.identity_id, day).unwrap();
        assert!(storage.load_events().unwrap().is_empty());
    }

    #[test]
    fn test_backup_copies_everything_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(&dir.path().join("live.db")).unwrap();
        let alice = identity(1, vec![vec![0.25, -0.5]]);
        storage.save_identity(&alice).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let event = AttendanceEvent {
            identity_id: alice.id.clone(),
            display_name: alice.display_name.clone(),
            day,
            first_seen: day.and_hms_opt(9, 0, 0).unwrap(),
            last_seen: day.and_hms_opt(9, 30, 0).unwrap(),
            occurrence_count: 3,
            source: EventSource::Manual,
        };
        storage.save_event(&event).unwrap();

        let dest = dir.path().join("backups").join("copy.db");
        storage.backup(&dest).unwrap();

        let copy = SqliteStorage::open(&dest).unwrap();
        assert_eq!(copy.load_identities().unwrap(), vec![alice]);
        assert_eq!(copy.load_events().unwrap(), vec![event]);

        let err = storage.backup(&dest).unwrap_err();
        assert!(matches!(err, StorageError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
    }
}
