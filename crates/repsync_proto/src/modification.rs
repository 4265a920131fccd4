//! Destructive and structural events carried by change sets.

use crate::path::RepoPath;
use crate::types::{Revision, Sha1Hash};
use serde::{Deserialize, Serialize};

/// The payload of a modification record.
///
/// Deletions and copies are first-class events: unlike ordinary file
/// entries, they cannot be inferred from the presence or absence of a
/// node in the receiver's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationData {
    /// An entity (and its subtree) was deleted.
    Delete {
        /// Path of the deleted entity. The empty (root) path signals that
        /// the whole prefix-scoped subtree vanished.
        path: RepoPath,
        /// Length of the deleted normal file, if one.
        length: Option<u64>,
        /// Content hash of the deleted normal file, if one.
        sha1: Option<Sha1Hash>,
    },
    /// An entity was copied to a new path.
    Copy {
        /// Source path.
        from: RepoPath,
        /// Destination path.
        to: RepoPath,
    },
}

/// A modification record, stamped with the sender's revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationDto {
    /// Sender revision at which the event occurred.
    pub revision: Revision,
    /// The event.
    pub data: ModificationData,
}

impl ModificationDto {
    /// Creates a delete record.
    pub fn delete(
        revision: Revision,
        path: RepoPath,
        length: Option<u64>,
        sha1: Option<Sha1Hash>,
    ) -> Self {
        Self {
            revision,
            data: ModificationData::Delete { path, length, sha1 },
        }
    }

    /// Creates a copy record.
    pub fn copy(revision: Revision, from: RepoPath, to: RepoPath) -> Self {
        Self {
            revision,
            data: ModificationData::Copy { from, to },
        }
    }

    /// Returns the path a delete record targets, if this is a delete.
    #[must_use]
    pub fn delete_path(&self) -> Option<&RepoPath> {
        match &self.data {
            ModificationData::Delete { path, .. } => Some(path),
            ModificationData::Copy { .. } => None,
        }
    }
}
