//! Durable state behind the identity store and the attendance ledger.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use crate::identity::{Identity, IdentityId};
use crate::ledger::AttendanceEvent;
use chrono::NaiveDate;
use std::io;
use std::path::Path;

/// Persistence backend.
///
/// Implementations must be safe for concurrent use, and every write must be
/// all-or-nothing: `save_identity` replaces the identity row and its full
/// reference set atomically, and `save_event` is an upsert keyed by
/// (identity, day).
pub trait Storage: Send + Sync {
    /// All identities, in enrollment order, with their references in insertion order.
    fn load_identities(&self) -> Result<Vec<Identity>, StorageError>;

    fn save_identity(&self, identity: &Identity) -> Result<(), StorageError>;

    /// Deleting an absent identity is not an error.
    fn delete_identity(&self, id: &IdentityId) -> Result<(), StorageError>;

    fn load_events(&self) -> Result<Vec<AttendanceEvent>, StorageError>;

    fn save_event(&self, event: &AttendanceEvent) -> Result<(), StorageError>;

    /// Deleting an absent event is not an error.
    fn delete_event(&self, identity_id: &IdentityId, day: NaiveDate) -> Result<(), StorageError>;

    /// Write a consistent copy of all identities and events to a new SQLite
    /// database at `dest`, which `SqliteStorage::open` can load. Fails if
    /// `dest` already exists.
    fn backup(&self, dest: &Path) -> Result<(), StorageError>;
}

/// Refuse to overwrite `dest` and create its parent directories.
fn prepare_backup_target(dest: &Path) -> Result<(), StorageError> {
    if dest.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("backup target {} already exists", dest.display()),
        )
        .into());
    }
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
