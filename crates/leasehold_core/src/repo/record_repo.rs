//! Concurrency-guarded record store contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide Create/Read/Update/Delete over records keyed by `RecordId`.
//! - Guard every update with the version token the caller last read.
//! - Tell "record is gone" apart from "record changed under you".
//!
//! # Invariants
//! - Create reports a duplicate id (or duplicate unique column) as a
//!   distinguishable outcome, never as a transport error.
//! - Update is one conditional statement; a zero-row result is disambiguated
//!   inside the same `IMMEDIATE` transaction.
//! - Delete is unconditional and idempotent.
//! - Store connectivity failures surface unchanged as `RepoError::Db`.

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::record::{Record, RecordId, VersionToken};
use log::debug;
use rusqlite::types::{ToSql, Value};
use rusqlite::{
    ffi, params, params_from_iter, Connection, ErrorCode, Row, Transaction, TransactionBehavior,
};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use uuid::Uuid;

/// Columns every record table carries ahead of the item columns.
const ENVELOPE_COLUMNS: &[&str] = &["id", "version_token", "created_at", "updated_at"];

pub type RepoResult<T> = Result<T, RepoError>;

/// Why a write was rejected as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Create targeted an id (or unique column value) that already exists.
    AlreadyExists,
    /// Update presented a version token that no longer matches.
    StaleVersion,
}

/// Errors from record store operations.
#[derive(Debug)]
pub enum RepoError {
    /// Underlying SQLite/bootstrap error, propagated unchanged.
    Db(DbError),
    /// Target record does not exist.
    NotFound(RecordId),
    /// Write rejected by a uniqueness or version check.
    Conflict {
        id: RecordId,
        reason: ConflictReason,
    },
    /// Caller-supplied argument is unusable.
    InvalidInput(String),
    /// Persisted data cannot be converted to a valid record.
    InvalidData(String),
    /// The caller cancelled before the next statement was issued.
    Cancelled,
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::Conflict {
                id,
                reason: ConflictReason::AlreadyExists,
            } => write!(f, "record already exists: {id}"),
            Self::Conflict {
                id,
                reason: ConflictReason::StaleVersion,
            } => write!(
                f,
                "record {id} was changed by someone else; reread it and try again"
            ),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted record data: {message}"),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::NotFound(_) => None,
            Self::Conflict { .. } => None,
            Self::InvalidInput(_) => None,
            Self::InvalidData(_) => None,
            Self::Cancelled => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Result of an insert that may lose a uniqueness race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome<T> {
    Created(Record<T>),
    /// A row with the same id or unique column value already exists.
    Duplicate,
}

/// Paging options for listing records.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Keyed record storage with optimistic concurrency on update.
pub trait ConcurrencyGuardedStore<T> {
    /// Inserts a record unless its id (or a unique column) is taken.
    fn try_create(
        &self,
        id: RecordId,
        item: &T,
        cancel: &CancelToken,
    ) -> RepoResult<CreateOutcome<T>>;

    /// Reads one record with its current version token.
    fn read(&self, id: RecordId, cancel: &CancelToken) -> RepoResult<Record<T>>;

    /// Replaces the item if `expected` still matches the stored token.
    ///
    /// Returns the stored record carrying its new token.
    fn update(
        &self,
        id: RecordId,
        item: &T,
        expected: &VersionToken,
        cancel: &CancelToken,
    ) -> RepoResult<Record<T>>;

    /// Removes the record without a version check. Missing ids are ignored.
    fn delete(&self, id: RecordId, cancel: &CancelToken) -> RepoResult<()>;

    /// Lists records ordered by creation time, then id.
    fn list(&self, query: &ListQuery, cancel: &CancelToken) -> RepoResult<Vec<Record<T>>>;

    /// Removes every record and returns how many were removed.
    fn delete_all(&self, cancel: &CancelToken) -> RepoResult<usize>;

    /// Inserts a record, failing with `Conflict` if the id is taken.
    fn create(&self, id: RecordId, item: &T, cancel: &CancelToken) -> RepoResult<Record<T>> {
        match self.try_create(id, item, cancel)? {
            CreateOutcome::Created(record) => Ok(record),
            CreateOutcome::Duplicate => Err(RepoError::Conflict {
                id,
                reason: ConflictReason::AlreadyExists,
            }),
        }
    }

    /// Inserts a record under a freshly generated id.
    fn create_new(&self, item: &T, cancel: &CancelToken) -> RepoResult<Record<T>> {
        self.create(Uuid::new_v4(), item, cancel)
    }
}

impl<T, S: ConcurrencyGuardedStore<T> + ?Sized> ConcurrencyGuardedStore<T> for &S {
    fn try_create(
        &self,
        id: RecordId,
        item: &T,
        cancel: &CancelToken,
    ) -> RepoResult<CreateOutcome<T>> {
        (**self).try_create(id, item, cancel)
    }

    fn read(&self, id: RecordId, cancel: &CancelToken) -> RepoResult<Record<T>> {
        (**self).read(id, cancel)
    }

    fn update(
        &self,
        id: RecordId,
        item: &T,
        expected: &VersionToken,
        cancel: &CancelToken,
    ) -> RepoResult<Record<T>> {
        (**self).update(id, item, expected, cancel)
    }

    fn delete(&self, id: RecordId, cancel: &CancelToken) -> RepoResult<()> {
        (**self).delete(id, cancel)
    }

    fn list(&self, query: &ListQuery, cancel: &CancelToken) -> RepoResult<Vec<Record<T>>> {
        (**self).list(query, cancel)
    }

    fn delete_all(&self, cancel: &CancelToken) -> RepoResult<usize> {
        (**self).delete_all(cancel)
    }
}

/// Returns `Cancelled` once the caller has given up.
pub(crate) fn ensure_not_cancelled(cancel: &CancelToken) -> RepoResult<()> {
    if cancel.is_cancelled() {
        return Err(RepoError::Cancelled);
    }
    Ok(())
}

/// Mapping between an item type and its SQLite table.
///
/// The table must hold the envelope columns `id TEXT PRIMARY KEY`,
/// `version_token TEXT`, `created_at INTEGER`, `updated_at INTEGER` followed by
/// the item columns listed in `COLUMNS`.
pub trait TableRow: Sized + Clone {
    const TABLE: &'static str;
    /// Item columns, in the order `to_values` produces them.
    const COLUMNS: &'static [&'static str];

    fn to_values(&self) -> Vec<Value>;
    fn from_row(row: &Row<'_>) -> RepoResult<Self>;
}

/// SQLite-backed record store for one `TableRow` type.
pub struct SqliteRecordStore<'conn, T> {
    conn: &'conn Connection,
    _item: PhantomData<fn() -> T>,
}

impl<'conn, T: TableRow> SqliteRecordStore<'conn, T> {
    /// Creates a store from a migrated connection whose schema holds `T::TABLE`.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_table_ready::<T>(conn)?;
        Ok(Self {
            conn,
            _item: PhantomData,
        })
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    /// Loads the single record matching `where_sql`, if any.
    pub(crate) fn find_single_where(
        &self,
        where_sql: &str,
        params: &[&dyn ToSql],
        cancel: &CancelToken,
    ) -> RepoResult<Option<Record<T>>> {
        ensure_not_cancelled(cancel)?;
        let sql = format!("{} WHERE {where_sql} LIMIT 2;", select_sql::<T>());
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params)?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let record = parse_record_row::<T>(row)?;
        if rows.next()?.is_some() {
            return Err(RepoError::InvalidData(format!(
                "more than one row in `{}` matches `{where_sql}`",
                T::TABLE
            )));
        }
        Ok(Some(record))
    }

    /// Deletes every record matching `where_sql` in one statement.
    pub(crate) fn delete_where(
        &self,
        where_sql: &str,
        params: &[&dyn ToSql],
        cancel: &CancelToken,
    ) -> RepoResult<usize> {
        ensure_not_cancelled(cancel)?;
        let sql = format!("DELETE FROM {} WHERE {where_sql};", T::TABLE);
        Ok(self.conn.execute(&sql, params)?)
    }
}

impl<T: TableRow> ConcurrencyGuardedStore<T> for SqliteRecordStore<'_, T> {
    fn try_create(
        &self,
        id: RecordId,
        item: &T,
        cancel: &CancelToken,
    ) -> RepoResult<CreateOutcome<T>> {
        ensure_not_cancelled(cancel)?;
        let record = Record::new(id, item.clone(), SystemClock.now_ms());

        let mut values = vec![
            Value::Text(record.id.to_string()),
            Value::Text(record.version.as_str().to_string()),
            Value::Integer(record.created_at),
            Value::Integer(record.updated_at),
        ];
        values.extend(item.to_values());

        // Without a conflict target DO NOTHING covers the primary key and every
        // unique index, which is what lets lock rows report a lost race.
        let changed = self
            .conn
            .execute(&insert_sql::<T>(), params_from_iter(values))?;
        if changed == 0 {
            debug!(
                "event=record_create module=repo status=duplicate table={}",
                T::TABLE
            );
            return Ok(CreateOutcome::Duplicate);
        }

        debug!("event=record_create module=repo status=ok table={}", T::TABLE);
        Ok(CreateOutcome::Created(record))
    }

    fn read(&self, id: RecordId, cancel: &CancelToken) -> RepoResult<Record<T>> {
        ensure_not_cancelled(cancel)?;
        load_record::<T>(self.conn, id)?.ok_or(RepoError::NotFound(id))
    }

    fn update(
        &self,
        id: RecordId,
        item: &T,
        expected: &VersionToken,
        cancel: &CancelToken,
    ) -> RepoResult<Record<T>> {
        ensure_not_cancelled(cancel)?;
        let next_version = VersionToken::generate();
        let now = SystemClock.now_ms();

        let mut values = item.to_values();
        values.push(Value::Text(next_version.as_str().to_string()));
        values.push(Value::Integer(now));
        values.push(Value::Text(id.to_string()));
        values.push(Value::Text(expected.as_str().to_string()));

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let changed = match tx.execute(&update_sql::<T>(), params_from_iter(values)) {
            Ok(changed) => changed,
            Err(err) if is_uniqueness_violation(&err) => {
                debug!(
                    "event=record_update module=repo status=conflict reason=already_exists table={}",
                    T::TABLE
                );
                return Err(RepoError::Conflict {
                    id,
                    reason: ConflictReason::AlreadyExists,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if changed == 0 {
            let exists = record_exists::<T>(&tx, id)?;
            debug!(
                "event=record_update module=repo status={} table={}",
                if exists { "conflict" } else { "not_found" },
                T::TABLE
            );
            return Err(if exists {
                RepoError::Conflict {
                    id,
                    reason: ConflictReason::StaleVersion,
                }
            } else {
                RepoError::NotFound(id)
            });
        }

        let stored = load_record::<T>(&tx, id)?.ok_or(RepoError::NotFound(id))?;
        tx.commit()?;
        debug!("event=record_update module=repo status=ok table={}", T::TABLE);
        Ok(stored)
    }

    fn delete(&self, id: RecordId, cancel: &CancelToken) -> RepoResult<()> {
        let removed = self.delete_where("id = ?1", params![id.to_string()], cancel)?;
        debug!(
            "event=record_delete module=repo status=ok table={} removed={}",
            T::TABLE,
            removed
        );
        Ok(())
    }

    fn list(&self, query: &ListQuery, cancel: &CancelToken) -> RepoResult<Vec<Record<T>>> {
        ensure_not_cancelled(cancel)?;
        let mut sql = format!("{} ORDER BY created_at ASC, id ASC", select_sql::<T>());
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
            if query.offset > 0 {
                sql.push_str(" OFFSET ?");
                bind_values.push(Value::Integer(i64::from(query.offset)));
            }
        } else if query.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row::<T>(row)?);
        }
        Ok(records)
    }

    fn delete_all(&self, cancel: &CancelToken) -> RepoResult<usize> {
        self.delete_where("1 = 1", &[], cancel)
    }
}

fn select_sql<T: TableRow>() -> String {
    let columns = ENVELOPE_COLUMNS
        .iter()
        .chain(T::COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {columns} FROM {}", T::TABLE)
}

fn insert_sql<T: TableRow>() -> String {
    let columns = ENVELOPE_COLUMNS
        .iter()
        .chain(T::COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>();
    let placeholders = (1..=columns.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT DO NOTHING;",
        T::TABLE,
        columns.join(", ")
    )
}

fn update_sql<T: TableRow>() -> String {
    let column_count = T::COLUMNS.len();
    let mut assignments = T::COLUMNS
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{column} = ?{}", index + 1))
        .collect::<Vec<_>>();
    assignments.push(format!("version_token = ?{}", column_count + 1));
    assignments.push(format!("updated_at = ?{}", column_count + 2));
    format!(
        "UPDATE {} SET {} WHERE id = ?{} AND version_token = ?{};",
        T::TABLE,
        assignments.join(", "),
        column_count + 3,
        column_count + 4
    )
}

fn load_record<T: TableRow>(conn: &Connection, id: RecordId) -> RepoResult<Option<Record<T>>> {
    let mut stmt = conn.prepare(&format!("{} WHERE id = ?1;", select_sql::<T>()))?;
    let mut rows = stmt.query([id.to_string()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_record_row::<T>(row)?));
    }
    Ok(None)
}

fn record_exists<T: TableRow>(conn: &Connection, id: RecordId) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1);", T::TABLE),
        [id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn parse_record_row<T: TableRow>(row: &Row<'_>) -> RepoResult<Record<T>> {
    let id_text: String = row.get("id")?;
    let id = Uuid::parse_str(&id_text).map_err(|_| {
        RepoError::InvalidData(format!("invalid uuid `{id_text}` in {}.id", T::TABLE))
    })?;

    let version_text: String = row.get("version_token")?;
    if version_text.is_empty() {
        return Err(RepoError::InvalidData(format!(
            "empty version token for record {id} in {}",
            T::TABLE
        )));
    }

    Ok(Record {
        id,
        version: VersionToken::from_raw(version_text),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        item: T::from_row(row)?,
    })
}

/// Only duplicate keys are conflicts; CHECK, NOT NULL and foreign key
/// failures stay store errors.
fn is_uniqueness_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
    )
}

fn ensure_table_ready<T: TableRow>(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version < expected_version {
        return Err(RepoError::InvalidInput(format!(
            "record store requires schema version {expected_version} or later, got {actual_version}"
        )));
    }

    let columns = table_columns(conn, T::TABLE)?;
    if columns.is_empty() {
        return Err(RepoError::InvalidInput(format!(
            "record store requires table `{}`",
            T::TABLE
        )));
    }
    for required in ENVELOPE_COLUMNS.iter().chain(T::COLUMNS.iter()) {
        if !columns.iter().any(|column| column == required) {
            return Err(RepoError::InvalidInput(format!(
                "record store requires column `{required}` in table `{}`",
                T::TABLE
            )));
        }
    }
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> RepoResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::{insert_sql, update_sql, RepoResult, TableRow};
    use rusqlite::types::Value;
    use rusqlite::Row;

    #[derive(Debug, Clone)]
    struct Pair {
        lhs: i64,
        rhs: i64,
    }

    impl TableRow for Pair {
        const TABLE: &'static str = "pairs";
        const COLUMNS: &'static [&'static str] = &["lhs", "rhs"];

        fn to_values(&self) -> Vec<Value> {
            vec![Value::Integer(self.lhs), Value::Integer(self.rhs)]
        }

        fn from_row(row: &Row<'_>) -> RepoResult<Self> {
            Ok(Self {
                lhs: row.get("lhs")?,
                rhs: row.get("rhs")?,
            })
        }
    }

    #[test]
    fn insert_sql_binds_envelope_then_item_columns() {
        assert_eq!(
            insert_sql::<Pair>(),
            "INSERT INTO pairs (id, version_token, created_at, updated_at, lhs, rhs) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT DO NOTHING;"
        );
    }

    #[test]
    fn update_sql_guards_on_id_and_version() {
        assert_eq!(
            update_sql::<Pair>(),
            "UPDATE pairs SET lhs = ?1, rhs = ?2, version_token = ?3, updated_at = ?4 \
             WHERE id = ?5 AND version_token = ?6;"
        );
    }
}
