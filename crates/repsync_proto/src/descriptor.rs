//! Repository descriptors.

use crate::types::{RepoId, Revision};
use serde::{Deserialize, Serialize};

/// Identity and state of a repository as reported to peers.
///
/// Served without authentication; the public key lets a prospective peer
/// register a trust request before any data flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Repository id.
    pub id: RepoId,
    /// Repository public key, opaque bytes.
    pub public_key: Vec<u8>,
    /// Current revision of the repository's clock.
    pub revision: Revision,
}

impl RepositoryDescriptor {
    /// Creates a descriptor.
    pub fn new(id: RepoId, public_key: Vec<u8>, revision: Revision) -> Self {
        Self {
            id,
            public_key,
            revision,
        }
    }
}
