//! Error types for protocol data.

use crate::types::RepoId;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors raised while constructing or validating protocol data.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A path string or segment is not a legal repository path.
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath {
        /// The offending input.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A change set references a parent entry it does not contain.
    #[error("change set entry {id} references missing parent {parent_id}")]
    MissingParent {
        /// The entry whose parent is unresolved.
        id: RepoId,
        /// The referenced parent id.
        parent_id: RepoId,
    },

    /// A change set contains more than one (virtual) root entry.
    #[error("change set contains {count} root entries, expected at most one")]
    MultipleRoots {
        /// Number of root entries found.
        count: usize,
    },

    /// A child entry was ordered before its parent.
    #[error("change set entry {id} appears before its parent {parent_id}")]
    ParentOrdering {
        /// The entry ordered too early.
        id: RepoId,
        /// Its parent id.
        parent_id: RepoId,
    },
}
