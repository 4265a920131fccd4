//! Error types for the replica core.

use repsync_proto::{ProtoError, RepoPath};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in replica-core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error on the worktree or the metadata store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The metadata store could not be serialized or deserialized.
    #[error("store codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Another process holds the metadata store lock.
    #[error("metadata store locked: another process has exclusive access")]
    DatabaseLocked,

    /// The entity tree violates a structural invariant.
    ///
    /// Fatal: indicates local or peer corruption and aborts the session.
    #[error("structural invariant violated: {message}")]
    StructuralInvariant {
        /// Description of the violation.
        message: String,
    },

    /// No entity exists at the given path.
    #[error("entity not found: {path}")]
    EntityNotFound {
        /// The unresolved path.
        path: RepoPath,
    },

    /// The parent of the given path does not exist or is not a directory.
    #[error("parent not found or not a directory: {path}")]
    ParentNotFound {
        /// The path whose parent is unresolved.
        path: RepoPath,
    },

    /// A transfer-protocol operation was invoked in the wrong state.
    #[error("invalid file state for {path}: {message}")]
    InvalidFileState {
        /// The file's path.
        path: RepoPath,
        /// Why the operation is illegal.
        message: String,
    },

    /// An incoming write races with a pending delete recorded for the
    /// source peer. Fails only the single operation; the caller retries
    /// the item on a later pass.
    #[error("incoming write collides with pending delete covering {path}")]
    DeleteModificationCollision {
        /// The written path.
        path: RepoPath,
    },

    /// Symlinks are not supported on this platform.
    #[error("symlinks are not supported on this platform")]
    SymlinkUnsupported,

    /// Protocol-type error (invalid path, malformed change set).
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

impl CoreError {
    /// Creates a structural invariant error.
    pub fn structural(message: impl Into<String>) -> Self {
        Self::StructuralInvariant {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::structural("two roots");
        assert_eq!(
            err.to_string(),
            "structural invariant violated: two roots"
        );

        let err = CoreError::EntityNotFound {
            path: RepoPath::parse("/a/b").unwrap(),
        };
        assert!(err.to_string().contains("/a/b"));
    }
}
