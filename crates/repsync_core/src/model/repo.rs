//! Repository rows: the local singleton and per-peer bookkeeping.

use repsync_proto::{RepoId, Revision, REVISION_NONE};
use serde::{Deserialize, Serialize};

/// The local repository singleton.
///
/// Holds the revision clock. `revision` is mutated only by the store's
/// commit path; no row may carry a revision higher than this value at
/// commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRepository {
    /// Repository id.
    pub id: RepoId,
    /// Public key, opaque bytes.
    pub public_key: Vec<u8>,
    /// Current revision; strictly increasing across write transactions.
    pub revision: Revision,
}

/// One row per peer this repository has ever connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepository {
    /// Peer repository id.
    pub id: RepoId,
    /// Peer public key.
    pub public_key: Vec<u8>,
    /// Highest revision of the peer fully applied locally (the peer's
    /// clock). Used as the `since` watermark for down-phase pulls.
    pub local_revision: Revision,
    /// True until the trust request has been accepted.
    pub pending: bool,
}

impl RemoteRepository {
    /// Creates a pending row for a newly seen peer.
    pub fn pending(id: RepoId, public_key: Vec<u8>) -> Self {
        Self {
            id,
            public_key,
            local_revision: REVISION_NONE,
            pending: true,
        }
    }
}

/// Per-peer outgoing watermarks, on the local clock.
///
/// `revision_in_progress` is advanced to the current revision when a
/// change set for the peer is built, and folded into `revision_synced`
/// once the peer confirms receipt. Invariant: `revision_in_progress`
/// is either [`REVISION_NONE`] or `>= revision_synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncToRemoteRepo {
    /// Highest local revision the peer has confirmed receiving.
    pub revision_synced: Revision,
    /// Revision of the change set currently being streamed, or
    /// [`REVISION_NONE`] when no sync is in flight.
    pub revision_in_progress: Revision,
}

impl LastSyncToRemoteRepo {
    /// Creates the initial watermark pair.
    #[must_use]
    pub fn new() -> Self {
        Self {
            revision_synced: REVISION_NONE,
            revision_in_progress: REVISION_NONE,
        }
    }

    /// Folds the in-flight revision into the synced watermark.
    ///
    /// Idempotent: calling without a sync in flight changes nothing.
    pub fn complete(&mut self) {
        if self.revision_in_progress != REVISION_NONE {
            self.revision_synced = self.revision_in_progress;
            self.revision_in_progress = REVISION_NONE;
        }
    }

    /// Checks the watermark invariant.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.revision_in_progress == REVISION_NONE
            || self.revision_in_progress >= self.revision_synced
    }
}

impl Default for LastSyncToRemoteRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_lifecycle() {
        let mut w = LastSyncToRemoteRepo::new();
        assert_eq!(w.revision_synced, REVISION_NONE);
        assert!(w.is_consistent());

        w.revision_in_progress = 12;
        assert!(w.is_consistent());

        w.complete();
        assert_eq!(w.revision_synced, 12);
        assert_eq!(w.revision_in_progress, REVISION_NONE);

        // Completing again is a no-op.
        w.complete();
        assert_eq!(w.revision_synced, 12);
    }

    #[test]
    fn pending_remote() {
        let r = RemoteRepository::pending(RepoId::new(), vec![1]);
        assert!(r.pending);
        assert_eq!(r.local_revision, REVISION_NONE);
    }
}
