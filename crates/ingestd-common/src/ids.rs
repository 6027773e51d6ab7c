//! Typed ID wrappers for type safety across ingestd.
//!
//! Catalog ids are integers assigned by the store on insert; owner tokens
//! are random UUIDs minted by whoever claims a lease.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog-assigned identifier of an artifact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(i64);

impl ArtifactId {
    /// Wrap a raw catalog id.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw catalog id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for ArtifactId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl From<ArtifactId> for i64 {
    fn from(id: ArtifactId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies which processor handles an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactTypeId(i32);

impl ArtifactTypeId {
    /// Wrap a raw type id.
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw type id.
    #[must_use]
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl From<i32> for ArtifactTypeId {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ArtifactTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity that claims, renews and releases a lease.
///
/// Tokens carry no meaning beyond equality. The scheduler mints one per
/// dispatched artifact and the worker that picks the job up hands the lease
/// over to its own token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    /// Mint a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OwnerToken {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_id_roundtrip() {
        let id = ArtifactId::new(42);
        assert_eq!(id.get(), 42);
        assert_eq!(i64::from(id), 42);
        assert_eq!(ArtifactId::from(42), id);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_artifact_id_serializes_transparently() {
        let json = serde_json::to_string(&ArtifactId::new(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn test_owner_tokens_are_unique() {
        let a = OwnerToken::new();
        let b = OwnerToken::new();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }

    #[test]
    fn test_type_id_display() {
        assert_eq!(ArtifactTypeId::new(3).to_string(), "3");
    }
}
