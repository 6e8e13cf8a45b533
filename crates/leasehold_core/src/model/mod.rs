//! Storage-level data model.
//!
//! # Responsibility
//! - Define the record envelope every store persists.
//! - Define the lease lock row and the lock capability.
//!
//! # Invariants
//! - Every stored record carries a version token that changes on each write.
//! - Lock ownership is advisory: whoever presents the `LockId` owns the lease.

pub mod lock;
pub mod record;
