//! Tree node rows.

use repsync_proto::{
    FileChunkDto, RepoFileDto, RepoFileKindDto, RepoId, Revision, Sha1Hash, TimestampMs,
};
use serde::{Deserialize, Serialize};

/// One content-addressed byte range of a normal file.
///
/// Chunks are immutable once persisted; `end_put_file` and the scan
/// replace a file's chunk table wholesale instead of editing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Byte offset within the file.
    pub offset: u64,
    /// Chunk length in bytes.
    pub length: u32,
    /// SHA-1 of the chunk content.
    pub sha1: Sha1Hash,
}

impl From<FileChunk> for FileChunkDto {
    fn from(c: FileChunk) -> Self {
        FileChunkDto {
            offset: c.offset,
            length: c.length,
            sha1: c.sha1,
        }
    }
}

impl From<FileChunkDto> for FileChunk {
    fn from(c: FileChunkDto) -> Self {
        FileChunk {
            offset: c.offset,
            length: c.length,
            sha1: c.sha1,
        }
    }
}

/// Kind-specific state of a tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoFileKind {
    /// A directory.
    Directory,
    /// A regular file.
    NormalFile {
        /// Length in bytes.
        length: u64,
        /// SHA-1 of the whole content.
        sha1: Sha1Hash,
        /// Ordered chunk table.
        chunks: Vec<FileChunk>,
        /// True while a transfer into this file is open. In-progress
        /// files are excluded from outgoing change sets.
        in_progress: bool,
    },
    /// A symbolic link.
    Symlink {
        /// Link target, verbatim.
        target: String,
    },
}

/// A node of the repository tree.
///
/// `parent` is `None` only for the tree root, whose name is empty.
/// `(parent, name)` pairs are unique. `last_local_revision` is the
/// revision of the transaction that last changed this node; it does not
/// propagate to ancestors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoFile {
    /// Entity id, never reused.
    pub id: RepoId,
    /// Parent node, `None` for the root.
    pub parent: Option<RepoId>,
    /// Name, unique among siblings.
    pub name: String,
    /// Revision at which this node was last changed.
    pub last_local_revision: Revision,
    /// Filesystem modification time, milliseconds since the epoch.
    pub last_modified: TimestampMs,
    /// Creation time of the row.
    pub created: TimestampMs,
    /// Peer that last wrote this node, `None` after a local change.
    pub last_sync_from: Option<RepoId>,
    /// Kind-specific state.
    pub kind: RepoFileKind,
}

impl RepoFile {
    /// Returns true for directories.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, RepoFileKind::Directory)
    }

    /// Returns true for symlinks.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, RepoFileKind::Symlink { .. })
    }

    /// Returns true while a transfer into this file is open.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.kind,
            RepoFileKind::NormalFile {
                in_progress: true,
                ..
            }
        )
    }

    /// Length and hash, for normal files.
    #[must_use]
    pub fn content(&self) -> Option<(u64, Sha1Hash)> {
        match &self.kind {
            RepoFileKind::NormalFile { length, sha1, .. } => Some((*length, *sha1)),
            _ => None,
        }
    }

    /// The chunk table, for normal files.
    #[must_use]
    pub fn chunks(&self) -> Option<&[FileChunk]> {
        match &self.kind {
            RepoFileKind::NormalFile { chunks, .. } => Some(chunks),
            _ => None,
        }
    }

    /// Converts to the wire representation.
    ///
    /// `parent_override` replaces the stored parent (cleared together
    /// with the name for a virtual root).
    #[must_use]
    pub fn to_dto(&self, parent_override: Option<Option<RepoId>>) -> RepoFileDto {
        let (parent_id, name) = match parent_override {
            Some(None) => (None, String::new()),
            Some(Some(p)) => (Some(p), self.name.clone()),
            None => (self.parent, self.name.clone()),
        };
        RepoFileDto {
            id: self.id,
            parent_id,
            name,
            last_local_revision: self.last_local_revision,
            last_modified: self.last_modified,
            needed_as_parent: false,
            kind: match &self.kind {
                RepoFileKind::Directory => RepoFileKindDto::Directory,
                RepoFileKind::NormalFile {
                    length,
                    sha1,
                    chunks,
                    ..
                } => RepoFileKindDto::NormalFile {
                    length: *length,
                    sha1: *sha1,
                    chunks: chunks.iter().copied().map(Into::into).collect(),
                },
                RepoFileKind::Symlink { target } => RepoFileKindDto::Symlink {
                    target: target.clone(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(kind: RepoFileKind) -> RepoFile {
        RepoFile {
            id: RepoId::new(),
            parent: Some(RepoId::new()),
            name: "f".into(),
            last_local_revision: 4,
            last_modified: 1000,
            created: 900,
            last_sync_from: None,
            kind,
        }
    }

    #[test]
    fn kind_predicates() {
        assert!(file(RepoFileKind::Directory).is_directory());
        assert!(file(RepoFileKind::Symlink {
            target: "t".into()
        })
        .is_symlink());

        let nf = file(RepoFileKind::NormalFile {
            length: 3,
            sha1: Sha1Hash::digest(b"abc"),
            chunks: vec![],
            in_progress: true,
        });
        assert!(nf.is_in_progress());
        assert_eq!(nf.content().unwrap().0, 3);
    }

    #[test]
    fn virtual_root_dto_clears_parent_and_name() {
        let f = file(RepoFileKind::Directory);
        let dto = f.to_dto(Some(None));
        assert!(dto.parent_id.is_none());
        assert!(dto.name.is_empty());
        assert_eq!(dto.id, f.id);
    }

    #[test]
    fn plain_dto_keeps_identity() {
        let f = file(RepoFileKind::Directory);
        let dto = f.to_dto(None);
        assert_eq!(dto.parent_id, f.parent);
        assert_eq!(dto.name, "f");
    }
}
