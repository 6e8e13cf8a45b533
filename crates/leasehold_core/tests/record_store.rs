use leasehold_core::{
    open_db_in_memory, CancelToken, ConcurrencyGuardedStore, ConflictReason, CreateOutcome,
    ListQuery, MemoryRecordStore, RepoError, RepoResult, SqliteRecordStore, TableRow,
};
use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Widget {
    name: String,
    quantity: i64,
}

impl Widget {
    fn new(name: &str, quantity: i64) -> Self {
        Self {
            name: name.to_string(),
            quantity,
        }
    }
}

impl TableRow for Widget {
    const TABLE: &'static str = "widgets";
    const COLUMNS: &'static [&'static str] = &["name", "quantity"];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.name.clone()),
            Value::Integer(self.quantity),
        ]
    }

    fn from_row(row: &Row<'_>) -> RepoResult<Self> {
        Ok(Self {
            name: row.get("name")?,
            quantity: row.get("quantity")?,
        })
    }
}

fn widget_db() -> Connection {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE widgets (
            id TEXT PRIMARY KEY NOT NULL,
            version_token TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            name TEXT NOT NULL UNIQUE,
            quantity INTEGER NOT NULL
        );",
    )
    .unwrap();
    conn
}

fn memory_store() -> MemoryRecordStore<Widget> {
    MemoryRecordStore::with_unique_key(|widget| widget.name.clone())
}

/// Runs `check` against the SQLite store and the in-memory store.
fn for_each_store(check: impl Fn(&dyn ConcurrencyGuardedStore<Widget>)) {
    let conn = widget_db();
    let sqlite = SqliteRecordStore::<Widget>::try_new(&conn).unwrap();
    check(&sqlite);
    check(&memory_store());
}

#[test]
fn create_rejects_taken_id() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        let id = Uuid::new_v4();
        store.create(id, &Widget::new("bolt", 1), &cancel).unwrap();

        let err = store
            .create(id, &Widget::new("nut", 2), &cancel)
            .unwrap_err();
        assert!(matches!(
            err,
            RepoError::Conflict {
                reason: ConflictReason::AlreadyExists,
                ..
            }
        ));
        let outcome = store
            .try_create(id, &Widget::new("nut", 2), &cancel)
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Duplicate);
        assert_eq!(store.read(id, &cancel).unwrap().item, Widget::new("bolt", 1));
    });
}

#[test]
fn try_create_reports_unique_column_duplicate() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        store.create_new(&Widget::new("bolt", 1), &cancel).unwrap();

        let outcome = store
            .try_create(Uuid::new_v4(), &Widget::new("bolt", 9), &cancel)
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Duplicate);
    });
}

#[test]
fn read_missing_record_is_not_found() {
    for_each_store(|store| {
        let id = Uuid::new_v4();
        let err = store.read(id, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, RepoError::NotFound(missing) if missing == id));
    });
}

#[test]
fn update_returns_new_token_visible_to_next_read() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        let created = store.create_new(&Widget::new("bolt", 1), &cancel).unwrap();

        let updated = store
            .update(created.id, &Widget::new("bolt", 5), &created.version, &cancel)
            .unwrap();
        assert_ne!(updated.version, created.version);
        assert_eq!(updated.item.quantity, 5);
        assert_eq!(updated.created_at, created.created_at);

        let reread = store.read(created.id, &cancel).unwrap();
        assert_eq!(reread.version, updated.version);
        assert_eq!(reread.item, updated.item);
    });
}

#[test]
fn only_one_of_two_writers_with_same_token_wins() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        let created = store.create_new(&Widget::new("bolt", 1), &cancel).unwrap();
        let first_view = store.read(created.id, &cancel).unwrap();
        let second_view = store.read(created.id, &cancel).unwrap();

        store
            .update(created.id, &Widget::new("bolt", 2), &first_view.version, &cancel)
            .unwrap();
        let err = store
            .update(created.id, &Widget::new("bolt", 3), &second_view.version, &cancel)
            .unwrap_err();

        assert!(matches!(
            err,
            RepoError::Conflict {
                reason: ConflictReason::StaleVersion,
                ..
            }
        ));
        assert_eq!(store.read(created.id, &cancel).unwrap().item.quantity, 2);
    });
}

#[test]
fn update_of_missing_record_is_not_found_not_conflict() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        let created = store.create_new(&Widget::new("bolt", 1), &cancel).unwrap();
        store.delete(created.id, &cancel).unwrap();

        let err = store
            .update(created.id, &Widget::new("bolt", 2), &created.version, &cancel)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    });
}

#[test]
fn update_onto_taken_unique_value_is_conflict() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        store.create_new(&Widget::new("bolt", 1), &cancel).unwrap();
        let nut = store.create_new(&Widget::new("nut", 1), &cancel).unwrap();

        let err = store
            .update(nut.id, &Widget::new("bolt", 1), &nut.version, &cancel)
            .unwrap_err();
        assert!(matches!(
            err,
            RepoError::Conflict {
                reason: ConflictReason::AlreadyExists,
                ..
            }
        ));
        assert_eq!(store.read(nut.id, &cancel).unwrap().version, nut.version);
    });
}

#[test]
fn delete_is_idempotent() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        let created = store.create_new(&Widget::new("bolt", 1), &cancel).unwrap();

        store.delete(created.id, &cancel).unwrap();
        store.delete(created.id, &cancel).unwrap();
        store.delete(Uuid::new_v4(), &cancel).unwrap();
        assert!(store.read(created.id, &cancel).unwrap_err().is_not_found());
    });
}

#[test]
fn list_pages_cover_every_record_once() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        for index in 0..5 {
            store
                .create_new(&Widget::new(&format!("part-{index}"), index), &cancel)
                .unwrap();
        }

        let all = store.list(&ListQuery::default(), &cancel).unwrap();
        assert_eq!(all.len(), 5);

        let first = store
            .list(
                &ListQuery {
                    limit: Some(2),
                    offset: 0,
                },
                &cancel,
            )
            .unwrap();
        let rest = store
            .list(
                &ListQuery {
                    limit: None,
                    offset: 2,
                },
                &cancel,
            )
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 3);

        let paged_ids = first
            .iter()
            .chain(rest.iter())
            .map(|record| record.id)
            .collect::<Vec<_>>();
        let listed_ids = all.iter().map(|record| record.id).collect::<Vec<_>>();
        assert_eq!(paged_ids, listed_ids);
        assert_eq!(paged_ids.iter().collect::<BTreeSet<_>>().len(), 5);
    });
}

#[test]
fn delete_all_reports_removed_count() {
    for_each_store(|store| {
        let cancel = CancelToken::new();
        store.create_new(&Widget::new("bolt", 1), &cancel).unwrap();
        store.create_new(&Widget::new("nut", 1), &cancel).unwrap();

        assert_eq!(store.delete_all(&cancel).unwrap(), 2);
        assert!(store.list(&ListQuery::default(), &cancel).unwrap().is_empty());
    });
}

#[test]
fn cancelled_token_stops_every_operation() {
    for_each_store(|store| {
        let live = CancelToken::new();
        let created = store.create_new(&Widget::new("bolt", 1), &live).unwrap();
        let cancelled = CancelToken::new();
        cancelled.cancel();

        assert!(matches!(
            store.read(created.id, &cancelled),
            Err(RepoError::Cancelled)
        ));
        assert!(matches!(
            store.update(created.id, &Widget::new("bolt", 2), &created.version, &cancelled),
            Err(RepoError::Cancelled)
        ));
        assert!(matches!(
            store.create_new(&Widget::new("nut", 1), &cancelled),
            Err(RepoError::Cancelled)
        ));
        assert!(matches!(
            store.delete(created.id, &cancelled),
            Err(RepoError::Cancelled)
        ));
        assert_eq!(store.read(created.id, &live).unwrap().version, created.version);
    });
}

#[test]
fn sqlite_store_requires_its_table() {
    let conn = open_db_in_memory().unwrap();
    let err = SqliteRecordStore::<Widget>::try_new(&conn)
        .err()
        .expect("missing table must be rejected");
    assert!(matches!(err, RepoError::InvalidInput(_)));
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Gauge {
    level: i64,
}

impl TableRow for Gauge {
    const TABLE: &'static str = "gauges";
    const COLUMNS: &'static [&'static str] = &["level"];

    fn to_values(&self) -> Vec<Value> {
        vec![Value::Integer(self.level)]
    }

    fn from_row(row: &Row<'_>) -> RepoResult<Self> {
        Ok(Self {
            level: row.get("level")?,
        })
    }
}

#[test]
fn check_violation_on_update_is_a_store_error_not_a_conflict() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE gauges (
            id TEXT PRIMARY KEY NOT NULL,
            version_token TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            level INTEGER NOT NULL CHECK (level >= 0)
        );",
    )
    .unwrap();
    let store = SqliteRecordStore::<Gauge>::try_new(&conn).unwrap();
    let cancel = CancelToken::new();

    let created_err = store.create_new(&Gauge { level: -1 }, &cancel).unwrap_err();
    assert!(matches!(created_err, RepoError::Db(_)));

    let created = store.create_new(&Gauge { level: 3 }, &cancel).unwrap();
    let update_err = store
        .update(created.id, &Gauge { level: -1 }, &created.version, &cancel)
        .unwrap_err();
    assert!(matches!(update_err, RepoError::Db(_)), "got {update_err}");
    assert_eq!(store.read(created.id, &cancel).unwrap(), created);
}

#[test]
fn sqlite_store_accepts_caller_schema_versions_past_its_own() {
    let conn = widget_db();
    let caller_version = leasehold_core::db::migrations::latest_version() + 5;
    conn.execute_batch(&format!("PRAGMA user_version = {caller_version};"))
        .unwrap();

    let store = SqliteRecordStore::<Widget>::try_new(&conn).unwrap();
    store
        .create_new(&Widget::new("bolt", 1), &CancelToken::new())
        .unwrap();
}

#[test]
fn sqlite_store_rejects_unmigrated_connection() {
    let conn = Connection::open_in_memory().unwrap();
    let err = SqliteRecordStore::<Widget>::try_new(&conn)
        .err()
        .expect("unmigrated connection must be rejected");
    assert!(matches!(err, RepoError::InvalidInput(_)));
}
