//! Use-case services built on the record store contract.
//!
//! # Responsibility
//! - Turn guarded record operations into lease semantics.
//! - Keep CLI and embedding callers decoupled from storage details.

pub mod lease_lock;
