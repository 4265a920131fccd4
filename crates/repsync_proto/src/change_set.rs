//! Change sets: the unit of exchange between replicas.

use crate::descriptor::RepositoryDescriptor;
use crate::error::{ProtoError, ProtoResult};
use crate::file::RepoFileDto;
use crate::modification::ModificationDto;
use crate::types::RepoId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The bundle of records needed to bring a peer from one watermark to the
/// sender's current revision.
///
/// Receivers apply `modifications` first, in revision order, then `files`,
/// parents before children. Both orderings are produced by the builder and
/// verified by [`ChangeSet::verify`] on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Descriptor of the sending repository at build time.
    pub descriptor: RepositoryDescriptor,
    /// Delete/copy events after the watermark, in revision order.
    pub modifications: Vec<ModificationDto>,
    /// Changed tree nodes plus their ancestor closure, parents first.
    pub files: Vec<RepoFileDto>,
}

impl ChangeSet {
    /// Creates an empty change set for a descriptor.
    pub fn empty(descriptor: RepositoryDescriptor) -> Self {
        Self {
            descriptor,
            modifications: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Returns true when there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty() && self.files.is_empty()
    }

    /// Total number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modifications.len() + self.files.len()
    }

    /// Verifies the structural invariants a receiver depends on.
    ///
    /// - at most one (virtual) root entry;
    /// - every entry's parent is either absent (root) or listed **before**
    ///   the entry itself, so applying in order always finds the parent.
    ///
    /// A violation indicates sender or transport corruption and must abort
    /// the session rather than be patched over.
    pub fn verify(&self) -> ProtoResult<()> {
        let mut seen: HashSet<RepoId> = HashSet::with_capacity(self.files.len());
        let mut roots = 0usize;

        for file in &self.files {
            match file.parent_id {
                None => roots += 1,
                Some(parent_id) => {
                    if !seen.contains(&parent_id) {
                        // Distinguish "missing entirely" from "ordered late".
                        let present_later = self.files.iter().any(|f| f.id == parent_id);
                        return Err(if present_later {
                            ProtoError::ParentOrdering {
                                id: file.id,
                                parent_id,
                            }
                        } else {
                            ProtoError::MissingParent {
                                id: file.id,
                                parent_id,
                            }
                        });
                    }
                }
            }
            seen.insert(file.id);
        }

        if roots > 1 {
            return Err(ProtoError::MultipleRoots { count: roots });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::RepoFileDto;

    fn descriptor() -> RepositoryDescriptor {
        RepositoryDescriptor::new(RepoId::new(), vec![1, 2, 3], 10)
    }

    fn dir(id: RepoId, parent: Option<RepoId>, name: &str) -> RepoFileDto {
        RepoFileDto::directory(id, parent, name, 1, 0)
    }

    #[test]
    fn empty_set_verifies() {
        let set = ChangeSet::empty(descriptor());
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
        set.verify().unwrap();
    }

    #[test]
    fn parents_before_children_verifies() {
        let root = RepoId::new();
        let child = RepoId::new();
        let grandchild = RepoId::new();
        let set = ChangeSet {
            descriptor: descriptor(),
            modifications: Vec::new(),
            files: vec![
                dir(root, None, ""),
                dir(child, Some(root), "a"),
                dir(grandchild, Some(child), "b"),
            ],
        };
        set.verify().unwrap();
    }

    #[test]
    fn child_before_parent_is_rejected() {
        let root = RepoId::new();
        let child = RepoId::new();
        let set = ChangeSet {
            descriptor: descriptor(),
            modifications: Vec::new(),
            files: vec![dir(child, Some(root), "a"), dir(root, None, "")],
        };
        assert!(matches!(
            set.verify(),
            Err(ProtoError::ParentOrdering { .. })
        ));
    }

    #[test]
    fn unresolved_parent_is_rejected() {
        let set = ChangeSet {
            descriptor: descriptor(),
            modifications: Vec::new(),
            files: vec![dir(RepoId::new(), Some(RepoId::new()), "orphan")],
        };
        assert!(matches!(set.verify(), Err(ProtoError::MissingParent { .. })));
    }

    #[test]
    fn multiple_roots_are_rejected() {
        let set = ChangeSet {
            descriptor: descriptor(),
            modifications: Vec::new(),
            files: vec![dir(RepoId::new(), None, ""), dir(RepoId::new(), None, "")],
        };
        assert!(matches!(set.verify(), Err(ProtoError::MultipleRoots { .. })));
    }
}
