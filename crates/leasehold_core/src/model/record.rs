//! Generic stored-record envelope and version token.
//!
//! # Responsibility
//! - Wrap caller items with identity, version token and timestamps.
//! - Generate fresh version tokens for every successful write.
//!
//! # Invariants
//! - `version` changes on every successful write of the same `id`.
//! - Version tokens are compared for equality only; they carry no ordering.
//! - `created_at` never changes after creation.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of one stored record.
pub type RecordId = Uuid;

/// Opaque optimistic-concurrency stamp attached to every stored record.
///
/// Tokens are random strings. Two tokens are either equal or not; there is
/// no notion of one token being newer than another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    /// Generates a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wraps a token previously handed out by a store.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for VersionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One persisted item plus the metadata the store maintains for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: RecordId,
    /// Token to present on the next guarded update.
    pub version: VersionToken,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
    pub item: T,
}

impl<T> Record<T> {
    /// Builds the envelope for a brand new record.
    pub fn new(id: RecordId, item: T, now_ms: i64) -> Self {
        Self {
            id,
            version: VersionToken::generate(),
            created_at: now_ms,
            updated_at: now_ms,
            item,
        }
    }

    /// Returns the envelope a successful guarded write produces.
    ///
    /// Identity and `created_at` are kept; the token is regenerated.
    pub fn next_version(&self, item: T, now_ms: i64) -> Self {
        Self {
            id: self.id,
            version: VersionToken::generate(),
            created_at: self.created_at,
            updated_at: now_ms,
            item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Record, VersionToken};
    use uuid::Uuid;

    #[test]
    fn generated_tokens_do_not_repeat() {
        let first = VersionToken::generate();
        let second = VersionToken::generate();
        assert_ne!(first, second);
        assert_eq!(first.as_str().len(), 32);
    }

    #[test]
    fn next_version_keeps_identity_and_refreshes_token() {
        let record = Record::new(Uuid::new_v4(), "draft", 1_000);
        let next = record.next_version("final", 2_000);

        assert_eq!(next.id, record.id);
        assert_eq!(next.created_at, 1_000);
        assert_eq!(next.updated_at, 2_000);
        assert_ne!(next.version, record.version);
        assert_eq!(next.item, "final");
    }
}
