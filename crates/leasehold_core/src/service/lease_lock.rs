//! Lease-based distributed lock over a shared lock table.
//!
//! # Responsibility
//! - Grant time-bounded exclusive ownership of a resource to one caller.
//! - Let holders renew, let anyone reclaim expired leases, let holders release.
//! - Resolve the first-row insert race with a bounded retry.
//!
//! # Invariants
//! - Every lock row mutation is guarded by the row's own version token.
//! - A valid lease held under another `LockId` is never overwritten.
//! - Only the first-row insert race is retried internally; all other contention
//!   is reported to the caller as `ResourceLocked`.
//! - No call waits on another caller; contention fails fast.

use crate::cancel::CancelToken;
use crate::clock::{duration_to_ms, Clock, SystemClock};
use crate::config::StoreOptions;
use crate::model::lock::{Lock, LockEntry, LockId};
use crate::model::record::{Record, RecordId};
use crate::repo::lock_repo::LockTable;
use crate::repo::record_repo::{CreateOutcome, RepoError};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};
use uuid::Uuid;

const MAX_RESOURCE_ID_CHARS: usize = 512;

pub type LockResult<T> = Result<T, LockError>;

/// Errors from lease lock operations.
#[derive(Debug)]
pub enum LockError {
    /// Another holder has a valid lease, or won a race for the row.
    ResourceLocked {
        resource_id: String,
        /// How long until the current lease ends; zero means retry now.
        recommended_wait: Duration,
    },
    /// The first-row insert race was lost on every allowed attempt.
    RaceUnresolved { resource_id: String, attempts: u32 },
    /// Caller-supplied argument is unusable.
    InvalidInput(String),
    /// Store failure, propagated unchanged.
    Repo(RepoError),
}

impl LockError {
    /// Returns whether the caller should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceLocked { .. } | Self::RaceUnresolved { .. }
        )
    }

    /// Suggested back-off in seconds, when the lease holder is known.
    pub fn recommended_wait_seconds(&self) -> Option<f64> {
        match self {
            Self::ResourceLocked {
                recommended_wait, ..
            } => Some(recommended_wait.as_secs_f64()),
            _ => None,
        }
    }
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceLocked {
                resource_id,
                recommended_wait,
            } => write!(
                f,
                "resource `{resource_id}` is locked; try again in {:.3}s",
                recommended_wait.as_secs_f64()
            ),
            Self::RaceUnresolved {
                resource_id,
                attempts,
            } => write!(
                f,
                "racing condition for the lock row of resource `{resource_id}` after {attempts} attempts; try again"
            ),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for LockError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::ResourceLocked { .. } => None,
            Self::RaceUnresolved { .. } => None,
            Self::InvalidInput(_) => None,
        }
    }
}

impl From<RepoError> for LockError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// How an acquire obtained its lease; only used for diagnostics.
#[derive(Debug, Clone, Copy)]
enum AcquireMode {
    Created,
    Renewed,
    Stolen,
}

impl AcquireMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Renewed => "renewed",
            Self::Stolen => "stolen",
        }
    }
}

/// Lease lock service over any `LockTable`.
pub struct LeaseLockStore<L, C = SystemClock> {
    table: L,
    clock: C,
    options: StoreOptions,
}

impl<L: LockTable> LeaseLockStore<L, SystemClock> {
    /// Creates a service with default options and the wall clock.
    pub fn new(table: L) -> Self {
        Self::with_clock(table, StoreOptions::default(), SystemClock)
    }

    pub fn with_options(table: L, options: StoreOptions) -> Self {
        Self::with_clock(table, options, SystemClock)
    }
}

impl<L: LockTable, C: Clock> LeaseLockStore<L, C> {
    pub fn with_clock(table: L, options: StoreOptions, clock: C) -> Self {
        Self {
            table,
            clock,
            options,
        }
    }

    pub fn table(&self) -> &L {
        &self.table
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Claims, renews or steals the lease on `resource_id`.
    ///
    /// - `lease`: how long the lease stays valid; `None` uses the configured
    ///   default.
    /// - `current_lock_id`: the caller's lock id when renewing. A renewal keeps
    ///   the same `LockId`; any other successful acquire returns a new one.
    ///
    /// # Errors
    /// - `ResourceLocked` when a valid lease is held under another lock id, or
    ///   when another caller changed the row between our read and write.
    /// - `RaceUnresolved` when the first-row insert race could not be settled
    ///   within `insert_race_attempts`.
    pub fn acquire(
        &self,
        resource_id: &str,
        lease: Option<Duration>,
        current_lock_id: Option<LockId>,
        cancel: &CancelToken,
    ) -> LockResult<Lock> {
        let started_at = Instant::now();
        validate_resource_id(resource_id)?;
        let lease = lease.unwrap_or_else(|| self.options.default_lease());
        if lease.is_zero() {
            return Err(LockError::InvalidInput(
                "lease duration must be greater than zero".to_string(),
            ));
        }
        let lease_ms = duration_to_ms(lease);

        let attempts = self.options.insert_race_attempts.max(1);
        let mut existing = None;
        for attempt in 1..=attempts {
            if let Some(record) = self
                .table
                .find_by_resource(resource_id, cancel)
                .map_err(|err| log_repo_error("lock_acquire", resource_id, started_at, err))?
            {
                existing = Some(record);
                break;
            }

            let entry = LockEntry::new(resource_id, self.clock.now_ms().saturating_add(lease_ms));
            let outcome = self
                .table
                .try_create(Uuid::new_v4(), &entry, cancel)
                .map_err(|err| log_repo_error("lock_acquire", resource_id, started_at, err))?;
            match outcome {
                CreateOutcome::Created(record) => {
                    return Ok(log_acquired(&record, AcquireMode::Created, started_at));
                }
                CreateOutcome::Duplicate => {
                    debug!(
                        "event=lock_acquire module=lease status=race_retry resource_id={} attempt={}",
                        resource_id, attempt
                    );
                }
            }
        }

        let Some(record) = existing else {
            warn!(
                "event=lock_acquire module=lease status=race_unresolved resource_id={} attempts={} duration_ms={}",
                resource_id,
                attempts,
                started_at.elapsed().as_millis()
            );
            return Err(LockError::RaceUnresolved {
                resource_id: resource_id.to_string(),
                attempts,
            });
        };

        let now = self.clock.now_ms();
        let held_by_caller = current_lock_id == Some(record.item.lock_id);
        if record.item.is_valid_at(now) && !held_by_caller {
            let recommended_wait = record.item.remaining_at(now);
            debug!(
                "event=lock_acquire module=lease status=contended resource_id={} wait_ms={}",
                resource_id,
                recommended_wait.as_millis()
            );
            return Err(LockError::ResourceLocked {
                resource_id: resource_id.to_string(),
                recommended_wait,
            });
        }

        let mut entry = record.item.clone();
        let mode = if held_by_caller {
            AcquireMode::Renewed
        } else {
            entry.lock_id = Uuid::new_v4();
            AcquireMode::Stolen
        };
        entry.valid_until = now.saturating_add(lease_ms);

        match self
            .table
            .update(record.id, &entry, &record.version, cancel)
        {
            Ok(updated) => Ok(log_acquired(&updated, mode, started_at)),
            Err(RepoError::Conflict { .. }) | Err(RepoError::NotFound(_)) => {
                debug!(
                    "event=lock_acquire module=lease status=contended resource_id={} reason=row_changed",
                    resource_id
                );
                Err(LockError::ResourceLocked {
                    resource_id: resource_id.to_string(),
                    recommended_wait: Duration::ZERO,
                })
            }
            Err(err) => Err(log_repo_error("lock_acquire", resource_id, started_at, err)),
        }
    }

    /// Gives up the lease on `resource_id` if `lock_id` still holds it.
    ///
    /// Releasing a lease that expired, was stolen or never existed is not an
    /// error: the caller no longer holds it either way.
    pub fn release(
        &self,
        resource_id: &str,
        lock_id: LockId,
        cancel: &CancelToken,
    ) -> LockResult<()> {
        let started_at = Instant::now();
        validate_resource_id(resource_id)?;

        let removed = self
            .table
            .delete_held(resource_id, lock_id, cancel)
            .map_err(|err| log_repo_error("lock_release", resource_id, started_at, err))?;
        info!(
            "event=lock_release module=lease status=ok resource_id={} removed={} duration_ms={}",
            resource_id,
            removed,
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Returns the current holder of `resource_id`, if its lease is still valid.
    pub fn inspect(&self, resource_id: &str, cancel: &CancelToken) -> LockResult<Option<Lock>> {
        validate_resource_id(resource_id)?;
        let now = self.clock.now_ms();
        let record = self.table.find_by_resource(resource_id, cancel)?;
        Ok(record
            .filter(|record| record.item.is_valid_at(now))
            .map(|record| Lock::from(&record)))
    }

    /// Deletes lock rows whose lease has ended.
    ///
    /// Acquire never depends on this; expired rows are reclaimed in place.
    pub fn purge_expired(&self, cancel: &CancelToken) -> LockResult<usize> {
        let started_at = Instant::now();
        let removed = self
            .table
            .delete_expired(self.clock.now_ms(), cancel)
            .map_err(|err| log_repo_error("lock_purge", "*", started_at, err))?;
        info!(
            "event=lock_purge module=lease status=ok removed={} duration_ms={}",
            removed,
            started_at.elapsed().as_millis()
        );
        Ok(removed)
    }

    /// Claims, renews or steals the lease on one record of `table`.
    ///
    /// The lock is keyed by table and record id, so equal ids in different
    /// tables never contend. Locking a record does not guard its writes; those
    /// still go through the record's version token.
    pub fn acquire_record(
        &self,
        table: &str,
        id: RecordId,
        lease: Option<Duration>,
        current_lock_id: Option<LockId>,
        cancel: &CancelToken,
    ) -> LockResult<Lock> {
        let resource_id = record_resource_id(table, id)?;
        self.acquire(&resource_id, lease, current_lock_id, cancel)
    }

    /// Releases a lease taken with `acquire_record`.
    pub fn release_record(
        &self,
        table: &str,
        id: RecordId,
        lock_id: LockId,
        cancel: &CancelToken,
    ) -> LockResult<()> {
        let resource_id = record_resource_id(table, id)?;
        self.release(&resource_id, lock_id, cancel)
    }
}

/// Lock resource id for record `id` of `table`, e.g. `invoices/<uuid>`.
pub fn record_resource_id(table: &str, id: RecordId) -> LockResult<String> {
    let table = table.trim();
    if table.is_empty() || table.contains('/') {
        return Err(LockError::InvalidInput(
            "table name must be non-empty and cannot contain `/`".to_string(),
        ));
    }
    Ok(format!("{table}/{}", id.hyphenated()))
}

fn validate_resource_id(resource_id: &str) -> LockResult<()> {
    if resource_id.trim().is_empty() {
        return Err(LockError::InvalidInput(
            "resource_id cannot be empty".to_string(),
        ));
    }
    if resource_id.chars().count() > MAX_RESOURCE_ID_CHARS {
        return Err(LockError::InvalidInput(format!(
            "resource_id cannot exceed {MAX_RESOURCE_ID_CHARS} characters"
        )));
    }
    Ok(())
}

fn log_acquired(record: &Record<LockEntry>, mode: AcquireMode, started_at: Instant) -> Lock {
    info!(
        "event=lock_acquire module=lease status=ok mode={} resource_id={} valid_until={} duration_ms={}",
        mode.as_str(),
        record.item.resource_id,
        record.item.valid_until,
        started_at.elapsed().as_millis()
    );
    Lock::from(record)
}

fn log_repo_error(
    event: &'static str,
    resource_id: &str,
    started_at: Instant,
    err: RepoError,
) -> LockError {
    if !matches!(err, RepoError::Cancelled) {
        error!(
            "event={} module=lease status=error resource_id={} duration_ms={} error={}",
            event,
            resource_id,
            started_at.elapsed().as_millis(),
            err
        );
    }
    LockError::Repo(err)
}

#[cfg(test)]
mod tests {
    use super::{record_resource_id, validate_resource_id, LeaseLockStore, LockError};
    use crate::cancel::CancelToken;
    use crate::clock::ManualClock;
    use crate::config::StoreOptions;
    use crate::repo::lock_repo::MemoryLockTable;
    use std::time::Duration;

    fn service(clock: &ManualClock) -> LeaseLockStore<MemoryLockTable, ManualClock> {
        LeaseLockStore::with_clock(
            MemoryLockTable::for_locks(),
            StoreOptions::default(),
            clock.clone(),
        )
    }

    #[test]
    fn validate_resource_id_rejects_blank_and_oversized_ids() {
        assert!(validate_resource_id("  ").is_err());
        assert!(validate_resource_id(&"r".repeat(513)).is_err());
        assert!(validate_resource_id("workflow/step-7").is_ok());
    }

    #[test]
    fn acquire_without_lease_uses_configured_default() {
        let clock = ManualClock::new(1_000);
        let store = service(&clock);

        let lock = store
            .acquire("R1", None, None, &CancelToken::new())
            .unwrap();
        assert_eq!(lock.valid_until, 1_000 + 30_000);
    }

    #[test]
    fn zero_lease_is_invalid_input() {
        let clock = ManualClock::new(1_000);
        let store = service(&clock);

        let err = store
            .acquire("R1", Some(Duration::ZERO), None, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidInput(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn contended_error_reports_remaining_lease() {
        let clock = ManualClock::new(0);
        let store = service(&clock);
        let cancel = CancelToken::new();

        store
            .acquire("R1", Some(Duration::from_secs(5)), None, &cancel)
            .unwrap();
        clock.advance(Duration::from_millis(1_500));

        let err = store
            .acquire("R1", Some(Duration::from_secs(5)), None, &cancel)
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.recommended_wait_seconds(), Some(3.5));
    }

    #[test]
    fn cancelled_token_aborts_before_touching_the_table() {
        let clock = ManualClock::new(0);
        let store = service(&clock);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = store
            .acquire("R1", Some(Duration::from_secs(5)), None, &cancel)
            .unwrap_err();
        assert!(matches!(err, LockError::Repo(crate::RepoError::Cancelled)));
        assert!(store
            .inspect("R1", &CancelToken::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn record_resource_id_scopes_by_table() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            record_resource_id("invoices", id).unwrap(),
            "invoices/00000000-0000-0000-0000-000000000000"
        );
        assert!(record_resource_id(" ", id).is_err());
        assert!(record_resource_id("a/b", id).is_err());
    }
}
