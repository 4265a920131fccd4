//! Identifiers, revisions and content hashes.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use uuid::Uuid;

/// A repository-local revision number.
///
/// Revisions are assigned by the revision clock of one repository and are
/// strictly increasing across successive write transactions of that
/// repository. Revisions from different repositories are never compared.
pub type Revision = i64;

/// Sentinel for "no revision": used by watermarks before the first sync.
pub const REVISION_NONE: Revision = -1;

/// Milliseconds since the Unix epoch, mirroring filesystem timestamps.
pub type TimestampMs = i64;

/// Unique identifier for a repository or a tree entity.
///
/// Ids are 128-bit UUIDs that are globally unique, immutable once
/// assigned and never reused across identities.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoId([u8; 16]);

impl RepoId {
    /// Creates an id from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }

    /// Returns the first four bytes as lowercase hex.
    ///
    /// Used for collision-file name suffixes and log output.
    #[must_use]
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Default for RepoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoId({})", self.to_uuid())
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

impl From<Uuid> for RepoId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

impl From<RepoId> for Uuid {
    fn from(id: RepoId) -> Self {
        id.to_uuid()
    }
}

/// A SHA-1 content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha1Hash([u8; 20]);

impl Sha1Hash {
    /// Creates a hash from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Computes the hash of a byte slice.
    #[must_use]
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

/// Incremental SHA-1 hasher for streamed file content.
#[derive(Default)]
pub struct Sha1Hasher(Sha1);

impl Sha1Hasher {
    /// Creates a new hasher.
    #[must_use]
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    /// Feeds bytes into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalizes and returns the hash.
    #[must_use]
    pub fn finish(self) -> Sha1Hash {
        Sha1Hash(self.0.finalize().into())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({})", hex::encode(self.0))
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_uniqueness() {
        let a = RepoId::new();
        let b = RepoId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn repo_id_uuid_roundtrip() {
        let id = RepoId::new();
        let uuid: Uuid = id.into();
        assert_eq!(RepoId::from(uuid), id);
    }

    #[test]
    fn short_hex_length() {
        let id = RepoId::from_bytes([0xab; 16]);
        assert_eq!(id.short_hex(), "abababab");
    }

    #[test]
    fn sha1_known_vector() {
        // SHA-1 of the empty input.
        let hash = Sha1Hash::digest(b"");
        assert_eq!(hash.to_string(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = Sha1Hasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), Sha1Hash::digest(b"hello world"));
    }
}
