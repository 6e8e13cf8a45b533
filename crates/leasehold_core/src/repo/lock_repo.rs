//! Lock table contract over the concurrency-guarded stores.
//!
//! # Responsibility
//! - Map `LockEntry` onto the `distributed_locks` table.
//! - Add the resource-keyed lookups lease locking needs on top of CRUD.
//!
//! # Invariants
//! - Rows are unique per `locked_resource_id`; a second insert for the same
//!   resource reports `CreateOutcome::Duplicate`.
//! - Releasing matches on resource and lock id in one statement, so a lease
//!   stolen in between is never removed.

use crate::cancel::CancelToken;
use crate::model::lock::{LockEntry, LockId};
use crate::model::record::Record;
use crate::repo::memory_repo::MemoryRecordStore;
use crate::repo::record_repo::{
    ConcurrencyGuardedStore, RepoError, RepoResult, SqliteRecordStore, TableRow,
};
use rusqlite::types::Value;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

/// SQLite lock table bound to one connection.
pub type SqliteLockTable<'conn> = SqliteRecordStore<'conn, LockEntry>;

/// In-process lock table.
pub type MemoryLockTable = MemoryRecordStore<LockEntry>;

/// Storage operations lease locking needs beyond keyed CRUD.
pub trait LockTable: ConcurrencyGuardedStore<LockEntry> {
    /// Loads the lock row for `resource_id`, if one exists.
    fn find_by_resource(
        &self,
        resource_id: &str,
        cancel: &CancelToken,
    ) -> RepoResult<Option<Record<LockEntry>>>;

    /// Deletes the row for `resource_id` only if `lock_id` still holds it.
    ///
    /// Returns whether a row was removed.
    fn delete_held(
        &self,
        resource_id: &str,
        lock_id: LockId,
        cancel: &CancelToken,
    ) -> RepoResult<bool>;

    /// Deletes every row whose lease ended at or before `now_ms`.
    fn delete_expired(&self, now_ms: i64, cancel: &CancelToken) -> RepoResult<usize>;
}

impl TableRow for LockEntry {
    const TABLE: &'static str = "distributed_locks";
    const COLUMNS: &'static [&'static str] = &["lock_id", "locked_resource_id", "valid_until"];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.lock_id.to_string()),
            Value::Text(self.resource_id.clone()),
            Value::Integer(self.valid_until),
        ]
    }

    fn from_row(row: &Row<'_>) -> RepoResult<Self> {
        let lock_id_text: String = row.get("lock_id")?;
        let lock_id = Uuid::parse_str(&lock_id_text).map_err(|_| {
            RepoError::InvalidData(format!(
                "invalid uuid `{lock_id_text}` in distributed_locks.lock_id"
            ))
        })?;

        Ok(Self {
            resource_id: row.get("locked_resource_id")?,
            lock_id,
            valid_until: row.get("valid_until")?,
        })
    }
}

impl<'conn> SqliteRecordStore<'conn, LockEntry> {
    /// Opens the lock table on a migrated connection.
    pub fn for_locks(conn: &'conn Connection) -> RepoResult<Self> {
        Self::try_new(conn)
    }
}

impl LockTable for SqliteRecordStore<'_, LockEntry> {
    fn find_by_resource(
        &self,
        resource_id: &str,
        cancel: &CancelToken,
    ) -> RepoResult<Option<Record<LockEntry>>> {
        self.find_single_where("locked_resource_id = ?1", params![resource_id], cancel)
    }

    fn delete_held(
        &self,
        resource_id: &str,
        lock_id: LockId,
        cancel: &CancelToken,
    ) -> RepoResult<bool> {
        let removed = self.delete_where(
            "locked_resource_id = ?1 AND lock_id = ?2",
            params![resource_id, lock_id.to_string()],
            cancel,
        )?;
        Ok(removed > 0)
    }

    fn delete_expired(&self, now_ms: i64, cancel: &CancelToken) -> RepoResult<usize> {
        self.delete_where("valid_until <= ?1", params![now_ms], cancel)
    }
}

impl MemoryRecordStore<LockEntry> {
    /// Creates an in-process lock table unique per resource.
    pub fn for_locks() -> Self {
        Self::with_unique_key(|entry| entry.resource_id.clone())
    }
}

impl LockTable for MemoryRecordStore<LockEntry> {
    fn find_by_resource(
        &self,
        resource_id: &str,
        cancel: &CancelToken,
    ) -> RepoResult<Option<Record<LockEntry>>> {
        self.find_first(|record| record.item.resource_id == resource_id, cancel)
    }

    fn delete_held(
        &self,
        resource_id: &str,
        lock_id: LockId,
        cancel: &CancelToken,
    ) -> RepoResult<bool> {
        let removed = self.remove_where(
            |record| record.item.resource_id == resource_id && record.item.lock_id == lock_id,
            cancel,
        )?;
        Ok(removed > 0)
    }

    fn delete_expired(&self, now_ms: i64, cancel: &CancelToken) -> RepoResult<usize> {
        self.remove_where(|record| !record.item.is_valid_at(now_ms), cancel)
    }
}

impl<L: LockTable + ?Sized> LockTable for &L {
    fn find_by_resource(
        &self,
        resource_id: &str,
        cancel: &CancelToken,
    ) -> RepoResult<Option<Record<LockEntry>>> {
        (**self).find_by_resource(resource_id, cancel)
    }

    fn delete_held(
        &self,
        resource_id: &str,
        lock_id: LockId,
        cancel: &CancelToken,
    ) -> RepoResult<bool> {
        (**self).delete_held(resource_id, lock_id, cancel)
    }

    fn delete_expired(&self, now_ms: i64, cancel: &CancelToken) -> RepoResult<usize> {
        (**self).delete_expired(now_ms, cancel)
    }
}
