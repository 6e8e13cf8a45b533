//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the concurrency-guarded record store contract.
//! - Isolate SQLite query details from lease orchestration.
//!
//! # Invariants
//! - Every update is guarded by the caller's last-read version token.
//! - Repository APIs return semantic errors (`NotFound`, `Conflict`) in
//!   addition to DB transport errors.

pub mod lock_repo;
pub mod memory_repo;
pub mod record_repo;
