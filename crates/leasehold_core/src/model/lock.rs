//! Lease lock row and the capability handed to lock holders.
//!
//! # Invariants
//! - At most one lock row exists per `resource_id`.
//! - A lease is valid while `valid_until > now`; afterwards anyone may take it.
//! - Holding a `LockId` is the only proof of ownership.

use crate::model::record::Record;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Opaque token naming the current lease holder.
pub type LockId = Uuid;

/// Item stored in the lock table for one protected resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Identity of the thing being protected.
    pub resource_id: String,
    /// Current holder.
    pub lock_id: LockId,
    /// Absolute lease expiry, Unix epoch milliseconds.
    pub valid_until: i64,
}

impl LockEntry {
    /// Creates an entry for a brand new holder.
    pub fn new(resource_id: impl Into<String>, valid_until: i64) -> Self {
        Self {
            resource_id: resource_id.into(),
            lock_id: Uuid::new_v4(),
            valid_until,
        }
    }

    /// Returns whether the lease is still valid at `now_ms`.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.valid_until > now_ms
    }

    /// Time left on the lease at `now_ms`, zero once expired.
    pub fn remaining_at(&self, now_ms: i64) -> Duration {
        let remaining = self.valid_until.saturating_sub(now_ms);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }
}

/// Proof of ownership returned by a successful acquire.
///
/// Present `lock_id` again to renew or release the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_id: String,
    pub lock_id: LockId,
    /// Unix epoch milliseconds.
    pub valid_until: i64,
}

impl From<&Record<LockEntry>> for Lock {
    fn from(record: &Record<LockEntry>) -> Self {
        Self {
            resource_id: record.item.resource_id.clone(),
            lock_id: record.item.lock_id,
            valid_until: record.item.valid_until,
        }
    }
}
