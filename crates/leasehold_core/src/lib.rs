//! Lease-based distributed locking over a concurrency-guarded record store.
//!
//! Services running as many instances point at the same store; the store's
//! optimistic concurrency is the only coordination between them.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, StoreOptions};
pub use db::{open_db, open_db_in_memory, open_db_with_options, DbError, DbResult};
pub use logging::{default_log_level, init_logging, init_stderr_logging, logging_status};
pub use model::lock::{Lock, LockEntry, LockId};
pub use model::record::{Record, RecordId, VersionToken};
pub use repo::lock_repo::{LockTable, MemoryLockTable, SqliteLockTable};
pub use repo::memory_repo::MemoryRecordStore;
pub use repo::record_repo::{
    ConcurrencyGuardedStore, ConflictReason, CreateOutcome, ListQuery, RepoError, RepoResult,
    SqliteRecordStore, TableRow,
};
pub use service::lease_lock::{record_resource_id, LeaseLockStore, LockError, LockResult};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
