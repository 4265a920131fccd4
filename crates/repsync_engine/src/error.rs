//! Error types for the sync engine.

use repsync_core::CoreError;
use repsync_proto::RepoPath;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether a fresh session may retry the operation.
        retryable: bool,
    },

    /// Malformed or inconsistent protocol data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An incoming write raced with a pending delete; only the single
    /// item fails and is retried on a later pass.
    #[error("write collides with pending delete covering {path}")]
    DeleteModificationCollision {
        /// The written path.
        path: RepoPath,
    },

    /// A structural invariant does not hold; fatal for the session, no
    /// watermark is committed.
    #[error("structural invariant violated: {0}")]
    StructuralInvariant(String),

    /// Replica-store failure.
    #[error("store error: {0}")]
    Store(CoreError),

    /// The session was cancelled between items.
    #[error("sync cancelled")]
    Cancelled,

    /// A session was started from a state that does not permit it.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// No transport is registered for a URL scheme.
    #[error("no transport registered for scheme `{scheme}`")]
    UnknownScheme {
        /// The unresolvable scheme.
        scheme: String,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a fresh session may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport {
                retryable: true,
                ..
            }
        )
    }

    /// Returns true when only the current item failed and the session
    /// should continue, retrying the item on a later pass.
    ///
    /// A missing parent is such a case: it means the ancestor entry was
    /// itself skipped earlier in the same pass (a pending-delete race),
    /// so the whole branch settles on a later pass.
    #[must_use]
    pub fn is_item_skip(&self) -> bool {
        matches!(
            self,
            SyncError::DeleteModificationCollision { .. }
                | SyncError::Store(CoreError::ParentNotFound { .. })
        )
    }
}

impl From<CoreError> for SyncError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::DeleteModificationCollision { path } => {
                SyncError::DeleteModificationCollision { path }
            }
            CoreError::StructuralInvariant { message } => SyncError::StructuralInvariant(message),
            other => SyncError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn core_error_mapping() {
        let e: SyncError = CoreError::DeleteModificationCollision {
            path: RepoPath::parse("/a").unwrap(),
        }
        .into();
        assert!(e.is_item_skip());

        let e: SyncError = CoreError::structural("two roots").into();
        assert!(matches!(e, SyncError::StructuralInvariant(_)));
        assert!(!e.is_item_skip());
    }
}
