//! File entries carried by change sets.

use crate::types::{RepoId, Revision, Sha1Hash, TimestampMs};
use serde::{Deserialize, Serialize};

/// One content-addressed byte range of a normal file.
///
/// Chunks are ordered by offset and cover the file without gaps. The
/// receiver compares chunk hashes against its local file to skip
/// transferring unchanged ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkDto {
    /// Byte offset of the chunk within the file.
    pub offset: u64,
    /// Length of the chunk in bytes.
    pub length: u32,
    /// SHA-1 hash of the chunk's content.
    pub sha1: Sha1Hash,
}

/// The kind-specific payload of a file entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoFileKindDto {
    /// A directory.
    Directory,
    /// A regular file with content metadata.
    NormalFile {
        /// File length in bytes.
        length: u64,
        /// SHA-1 hash of the whole content.
        sha1: Sha1Hash,
        /// Ordered chunk table.
        chunks: Vec<FileChunkDto>,
    },
    /// A symbolic link.
    Symlink {
        /// Link target, verbatim.
        target: String,
    },
}

/// A node of the repository tree as carried by a change set.
///
/// `parent_id` is `None` only for the (possibly virtual) root entry, whose
/// `name` is empty. Entries flagged `needed_as_parent` are present only so
/// the receiver can resolve paths; they must not be treated as content
/// updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFileDto {
    /// Entity id.
    pub id: RepoId,
    /// Parent entity id; `None` for the (virtual) root.
    pub parent_id: Option<RepoId>,
    /// Name, unique among siblings; empty for the (virtual) root.
    pub name: String,
    /// Revision at which this node last changed on the sender.
    pub last_local_revision: Revision,
    /// Filesystem modification time, milliseconds since the epoch.
    pub last_modified: TimestampMs,
    /// True when included only to complete an ancestor chain.
    pub needed_as_parent: bool,
    /// Kind-specific payload.
    pub kind: RepoFileKindDto,
}

impl RepoFileDto {
    /// Creates a directory entry.
    pub fn directory(
        id: RepoId,
        parent_id: Option<RepoId>,
        name: impl Into<String>,
        last_local_revision: Revision,
        last_modified: TimestampMs,
    ) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            last_local_revision,
            last_modified,
            needed_as_parent: false,
            kind: RepoFileKindDto::Directory,
        }
    }

    /// Creates a normal-file entry.
    #[allow(clippy::too_many_arguments)]
    pub fn normal_file(
        id: RepoId,
        parent_id: Option<RepoId>,
        name: impl Into<String>,
        last_local_revision: Revision,
        last_modified: TimestampMs,
        length: u64,
        sha1: Sha1Hash,
        chunks: Vec<FileChunkDto>,
    ) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            last_local_revision,
            last_modified,
            needed_as_parent: false,
            kind: RepoFileKindDto::NormalFile {
                length,
                sha1,
                chunks,
            },
        }
    }

    /// Creates a symlink entry.
    pub fn symlink(
        id: RepoId,
        parent_id: Option<RepoId>,
        name: impl Into<String>,
        last_local_revision: Revision,
        last_modified: TimestampMs,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            last_local_revision,
            last_modified,
            needed_as_parent: false,
            kind: RepoFileKindDto::Symlink {
                target: target.into(),
            },
        }
    }

    /// Marks this entry as included only for ancestor resolution.
    #[must_use]
    pub fn as_parent_only(mut self) -> Self {
        self.needed_as_parent = true;
        self
    }

    /// Returns true for directory entries.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, RepoFileKindDto::Directory)
    }

    /// Returns true for the (virtual) root entry.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind() {
        let id = RepoId::new();
        let parent = RepoId::new();

        let dir = RepoFileDto::directory(id, Some(parent), "d", 3, 1000);
        assert!(dir.is_directory());
        assert!(!dir.is_root());
        assert!(!dir.needed_as_parent);

        let link = RepoFileDto::symlink(id, Some(parent), "l", 3, 1000, "../t");
        assert_eq!(
            link.kind,
            RepoFileKindDto::Symlink {
                target: "../t".into()
            }
        );
    }

    #[test]
    fn parent_only_flag() {
        let dto = RepoFileDto::directory(RepoId::new(), None, "", 1, 0).as_parent_only();
        assert!(dto.needed_as_parent);
        assert!(dto.is_root());
    }

    #[test]
    fn normal_file_carries_chunks() {
        let sha = Sha1Hash::digest(b"abc");
        let chunk = FileChunkDto {
            offset: 0,
            length: 3,
            sha1: sha,
        };
        let dto = RepoFileDto::normal_file(
            RepoId::new(),
            Some(RepoId::new()),
            "f",
            7,
            2000,
            3,
            sha,
            vec![chunk],
        );
        match dto.kind {
            RepoFileKindDto::NormalFile { length, chunks, .. } => {
                assert_eq!(length, 3);
                assert_eq!(chunks.len(), 1);
            }
            _ => panic!("expected normal file"),
        }
    }
}
