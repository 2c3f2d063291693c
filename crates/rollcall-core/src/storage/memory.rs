use super::{prepare_backup_target, SqliteStorage, Storage};
use crate::error::StorageError;
use crate::identity::{Identity, IdentityId};
use crate::ledger::AttendanceEvent;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// In-memory [`Storage`]. Data is lost on restart.
///
/// Can be told to fail upcoming writes, which is how tests exercise the
/// retry and no-partial-write paths.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    identities: HashMap<IdentityId, Identity>,
    events: BTreeMap<(IdentityId, NaiveDate), AttendanceEvent>,
    fail_writes: u32,
    fail_transient: bool,
    writes: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes. Transient failures are eligible for retry.
    pub fn fail_next_writes(&self, count: u32, transient: bool) {
        let mut inner = self.lock();
        inner.fail_writes = count;
        inner.fail_transient = transient;
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryInner {
    fn begin_write(&mut self) -> Result<(), StorageError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(if self.fail_transient {
                StorageError::Transient("injected write failure".into())
            } else {
                StorageError::Corrupt("injected write failure".into())
            });
        }
        self.writes += 1;
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn load_identities(&self) -> Result<Vec<Identity>, StorageError> {
        let mut all: Vec<Identity> = self.lock().identities.values().cloned().collect();
        all.sort_by_key(|i| i.seq);
        Ok(all)
    }

    fn save_identity(&self, identity: &Identity) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.begin_write()?;
        inner.identities.insert(identity.id.clone(), identity.clone());
        Ok(())
    }

    fn delete_identity(&self, id: &IdentityId) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.begin_write()?;
        inner.identities.remove(id);
        Ok(())
    }

    fn load_events(&self) -> Result<Vec<AttendanceEvent>, StorageError> {
        Ok(self.lock().events.values().cloned().collect())
    }

    fn save_event(&self, event: &AttendanceEvent) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.begin_write()?;
        inner
            .events
            .insert((event.identity_id.clone(), event.day), event.clone());
        Ok(())
    }

    fn delete_event(&self, identity_id: &IdentityId, day: NaiveDate) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.begin_write()?;
        inner.events.remove(&(identity_id.clone(), day));
        Ok(())
    }

    fn backup(&self, dest: &Path) -> Result<(), StorageError> {
        prepare_backup_target(dest)?;
        let (identities, events) = {
            let inner = self.lock();
            let mut identities: Vec<Identity> = inner.identities.values().cloned().collect();
            identities.sort_by_key(|i| i.seq);
            let events: Vec<AttendanceEvent> = inner.events.values().cloned().collect();
            (identities, events)
        };

        let target = SqliteStorage::open(dest)?;
        for identity in &identities {
            target.save_identity(identity)?;
        }
        for event in &events {
            target.save_event(event)?;
        }
        Ok(())
    }
}
