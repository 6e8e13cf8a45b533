//! In-process implementation of the concurrency-guarded store.
//!
//! # Responsibility
//! - Mirror `SqliteRecordStore` semantics for tests and single-process callers.
//!
//! # Invariants
//! - Every operation runs under one mutex acquisition, so check-then-write
//!   sequences are atomic.
//! - Stored records are cloned in and out; callers never alias stored state.
//! - An optional unique key behaves like a unique index: a second record with
//!   the same key is a duplicate.

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::model::record::{Record, RecordId, VersionToken};
use crate::repo::record_repo::{
    ensure_not_cancelled, ConcurrencyGuardedStore, ConflictReason, CreateOutcome, ListQuery,
    RepoError, RepoResult,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutex-guarded map of records.
pub struct MemoryRecordStore<T> {
    rows: Mutex<BTreeMap<RecordId, Record<T>>>,
    unique_key: Option<fn(&T) -> String>,
}

impl<T: Clone> Default for MemoryRecordStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> MemoryRecordStore<T> {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            unique_key: None,
        }
    }

    /// Creates a store that also rejects two records sharing `unique_key`.
    pub fn with_unique_key(unique_key: fn(&T) -> String) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            unique_key: Some(unique_key),
        }
    }

    /// Returns the first record accepted by `predicate`, in id order.
    pub(crate) fn find_first(
        &self,
        predicate: impl Fn(&Record<T>) -> bool,
        cancel: &CancelToken,
    ) -> RepoResult<Option<Record<T>>> {
        ensure_not_cancelled(cancel)?;
        Ok(self.rows().values().find(|record| predicate(record)).cloned())
    }

    /// Removes every record accepted by `predicate`.
    pub(crate) fn remove_where(
        &self,
        predicate: impl Fn(&Record<T>) -> bool,
        cancel: &CancelToken,
    ) -> RepoResult<usize> {
        ensure_not_cancelled(cancel)?;
        let mut rows = self.rows();
        let before = rows.len();
        rows.retain(|_, record| !predicate(record));
        Ok(before - rows.len())
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<RecordId, Record<T>>> {
        // A panic while holding the guard cannot leave a half-written record:
        // every mutation is a single map operation.
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_taken(
        &self,
        rows: &BTreeMap<RecordId, Record<T>>,
        item: &T,
        except: Option<RecordId>,
    ) -> bool {
        let Some(unique_key) = self.unique_key else {
            return false;
        };
        let key = unique_key(item);
        rows.values()
            .any(|record| Some(record.id) != except && unique_key(&record.item) == key)
    }
}

impl<T: Clone> ConcurrencyGuardedStore<T> for MemoryRecordStore<T> {
    fn try_create(
        &self,
        id: RecordId,
        item: &T,
        cancel: &CancelToken,
    ) -> RepoResult<CreateOutcome<T>> {
        ensure_not_cancelled(cancel)?;
        let mut rows = self.rows();
        if rows.contains_key(&id) || self.key_taken(&rows, item, None) {
            return Ok(CreateOutcome::Duplicate);
        }

        let record = Record::new(id, item.clone(), SystemClock.now_ms());
        rows.insert(id, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    fn read(&self, id: RecordId, cancel: &CancelToken) -> RepoResult<Record<T>> {
        ensure_not_cancelled(cancel)?;
        self.rows().get(&id).cloned().ok_or(RepoError::NotFound(id))
    }

    fn update(
        &self,
        id: RecordId,
        item: &T,
        expected: &VersionToken,
        cancel: &CancelToken,
    ) -> RepoResult<Record<T>> {
        ensure_not_cancelled(cancel)?;
        let mut rows = self.rows();
        let current = rows.get(&id).ok_or(RepoError::NotFound(id))?;
        if &current.version != expected {
            return Err(RepoError::Conflict {
                id,
                reason: ConflictReason::StaleVersion,
            });
        }
        if self.key_taken(&rows, item, Some(id)) {
            return Err(RepoError::Conflict {
                id,
                reason: ConflictReason::AlreadyExists,
            });
        }

        let next = current.next_version(item.clone(), SystemClock.now_ms());
        rows.insert(id, next.clone());
        Ok(next)
    }

    fn delete(&self, id: RecordId, cancel: &CancelToken) -> RepoResult<()> {
        ensure_not_cancelled(cancel)?;
        self.rows().remove(&id);
        Ok(())
    }

    fn list(&self, query: &ListQuery, cancel: &CancelToken) -> RepoResult<Vec<Record<T>>> {
        ensure_not_cancelled(cancel)?;
        let mut records = self.rows().values().cloned().collect::<Vec<_>>();
        records.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });

        let limit = query.limit.map_or(usize::MAX, |limit| limit as usize);
        Ok(records
            .into_iter()
            .skip(query.offset as usize)
            .take(limit)
            .collect())
    }

    fn delete_all(&self, cancel: &CancelToken) -> RepoResult<usize> {
        ensure_not_cancelled(cancel)?;
        let mut rows = self.rows();
        let removed = rows.len();
        rows.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryRecordStore;
    use crate::cancel::CancelToken;
    use crate::repo::record_repo::{ConcurrencyGuardedStore, CreateOutcome};
    use uuid::Uuid;

    #[test]
    fn unique_key_rejects_second_record_with_same_key() {
        let store = MemoryRecordStore::<String>::with_unique_key(|item| item.to_lowercase());
        let cancel = CancelToken::new();

        store
            .create(Uuid::new_v4(), &"Alpha".to_string(), &cancel)
            .unwrap();
        let outcome = store
            .try_create(Uuid::new_v4(), &"ALPHA".to_string(), &cancel)
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Duplicate);
    }

    #[test]
    fn remove_where_reports_removed_count() {
        let store = MemoryRecordStore::<i64>::new();
        let cancel = CancelToken::new();
        for value in [1, 2, 3, 4] {
            store.create_new(&value, &cancel).unwrap();
        }

        let removed = store.remove_where(|record| record.item % 2 == 0, &cancel).unwrap();
        assert_eq!(removed, 2);
        assert!(store
            .find_first(|record| record.item == 2, &cancel)
            .unwrap()
            .is_none());
    }
}
