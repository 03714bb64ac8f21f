//! Storage seams for the registry and ledger, plus an in-memory implementation.
//!
//! Backends must make [`AttendanceStore::insert_if_absent`] a single atomic
//! operation keyed on `(identity_id, date)`; the ledger never reads before writing.

use crate::report::RecordFilter;
use crate::types::{AttendanceRecord, Descriptor, EnrolledFace, Identity};
use chrono::NaiveDate;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of an insert-if-absent on the per-day attendance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Identity directory: attaches display names to ids.
pub trait IdentityDirectory {
    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError>;
    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError>;
}

/// One active descriptor per identity.
pub trait DescriptorStore {
    /// Insert or replace the descriptor of `identity_id`. No history is kept.
    fn upsert_descriptor(&self, identity_id: &str, descriptor: &Descriptor)
        -> Result<(), StoreError>;
    /// Every enrolled descriptor joined with its identity's name.
    fn load_descriptors(&self) -> Result<Vec<EnrolledFace>, StoreError>;
}

pub trait AttendanceStore {
    /// Commit `record` unless one already exists for its `(identity_id, date)`.
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError>;
    /// Records matching `filter`, in no particular order.
    fn query_records(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>, StoreError>;
}

impl<T: IdentityDirectory + ?Sized> IdentityDirectory for Arc<T> {
    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        (**self).upsert_identity(identity)
    }

    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        (**self).get_identity(id)
    }
}

impl<T: DescriptorStore + ?Sized> DescriptorStore for Arc<T> {
    fn upsert_descriptor(
        &self,
        identity_id: &str,
        descriptor: &Descriptor,
    ) -> Result<(), StoreError> {
        (**self).upsert_descriptor(identity_id, descriptor)
    }

    fn load_descriptors(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        (**self).load_descriptors()
    }
}

impl<T: AttendanceStore + ?Sized> AttendanceStore for Arc<T> {
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        (**self).insert_if_absent(record)
    }

    fn query_records(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        (**self).query_records(filter)
    }
}

#[derive(Default)]
struct MemoryInner {
    identities: BTreeMap<String, Identity>,
    descriptors: BTreeMap<String, Descriptor>,
    records: HashMap<(String, NaiveDate), AttendanceRecord>,
}

/// Process-local store guarded by a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Number of committed attendance records.
    pub fn record_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.records.len())
    }
}

impl IdentityDirectory for MemoryStore {
    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.lock()?
            .identities
            .insert(identity.id.clone(), identity.clone());
        Ok(())
    }

    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.lock()?.identities.get(id).cloned())
    }
}

impl DescriptorStore for MemoryStore {
    fn upsert_descriptor(
        &self,
        identity_id: &str,
        descriptor: &Descriptor,
    ) -> Result<(), StoreError> {
        self.lock()?
            .descriptors
            .insert(identity_id.to_string(), descriptor.clone());
        Ok(())
    }

    fn load_descriptors(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .descriptors
            .iter()
            .filter_map(|(id, descriptor)| {
                inner.identities.get(id).map(|identity| EnrolledFace {
                    identity_id: id.clone(),
                    name: identity.name.clone(),
                    descriptor: descriptor.clone(),
                })
            })
            .collect())
    }
}

impl AttendanceStore for MemoryStore {
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.lock()?;
        match inner
            .records
            .entry((record.identity_id.clone(), record.date))
        {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    fn query_records(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self
            .lock()?
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttendanceStatus, Role};

    fn record(id: &str, date: NaiveDate, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            identity_id: id.into(),
            date,
            time: "08:30:00".into(),
            status,
        }
    }

    #[test]
    fn test_insert_if_absent_is_write_once() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let first = record("a", day, AttendanceStatus::Present);
        let second = record("a", day, AttendanceStatus::Late);

        assert_eq!(store.insert_if_absent(&first).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_if_absent(&second).unwrap(), InsertOutcome::AlreadyExists);

        let stored = store.query_records(&RecordFilter::default()).unwrap();
        assert_eq!(stored, vec![first]);
    }

    #[test]
    fn test_next_day_is_a_new_slot() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let next = day.succ_opt().unwrap();
        store.insert_if_absent(&record("a", day, AttendanceStatus::Present)).unwrap();
        assert_eq!(
            store.insert_if_absent(&record("a", next, AttendanceStatus::Present)).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(store.record_count().unwrap(), 2);
    }

    #[test]
    fn test_load_descriptors_skips_unknown_identities() {
        let store = MemoryStore::new();
        store
            .upsert_identity(&Identity {
                id: "a".into(),
                name: "Ada".into(),
                role: Role::Student,
                section: None,
            })
            .unwrap();
        store.upsert_descriptor("a", &Descriptor::new(vec![1.0])).unwrap();
        store.upsert_descriptor("ghost", &Descriptor::new(vec![2.0])).unwrap();

        let faces = store.load_descriptors().unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].name, "Ada");
    }
}
