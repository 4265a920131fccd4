//! Modification log rows.

use repsync_proto::{ModificationData, ModificationDto, RepoId, Revision};
use serde::{Deserialize, Serialize};

/// One destructive/structural event, scoped to a destination peer.
///
/// Rows are append-only and garbage-collected once the destination
/// confirms receipt of all modifications up to its synced watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationRow {
    /// Row id.
    pub id: RepoId,
    /// Destination peer this row must reach.
    pub remote: RepoId,
    /// Local revision at which the event occurred.
    pub revision: Revision,
    /// The event.
    pub data: ModificationData,
}

impl ModificationRow {
    /// Creates a row.
    pub fn new(remote: RepoId, revision: Revision, data: ModificationData) -> Self {
        Self {
            id: RepoId::new(),
            remote,
            revision,
            data,
        }
    }

    /// Converts to the wire representation.
    #[must_use]
    pub fn to_dto(&self) -> ModificationDto {
        ModificationDto {
            revision: self.revision,
            data: self.data.clone(),
        }
    }
}
