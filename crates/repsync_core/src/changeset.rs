//! Change-set builder.
//!
//! Computes, for one destination peer, the minimal consistent set of
//! modification and file records needed to bring it up to date: every
//! row stamped after the peer's watermark, plus the ancestor closure of
//! each such row so the receiver can always resolve full paths.
//!
//! The builder captures the repository revision and advances the peer's
//! in-flight watermark strictly **before** querying rows, and bounds the
//! query by the captured revision: writes committed concurrently with
//! the query land in the next change set instead of being silently
//! skipped.

use crate::error::CoreResult;
use crate::replica::Replica;
use repsync_proto::{
    ChangeSet, ModificationData, ModificationDto, RepoId, RepoPath, RepositoryDescriptor,
    Revision,
};
use std::collections::HashMap;
use tracing::debug;

impl Replica {
    /// Builds the change set bringing `dest` up to date.
    ///
    /// `since` overrides the stored watermark when non-negative (the
    /// requesting peer passes the revision it last absorbed).
    /// `path_prefix` scopes the set to a subtree, whose root is emitted
    /// as a synthetic virtual root; when that subtree root is itself
    /// gone, the set carries a delete of the empty path so the peer can
    /// tell its mount point vanished.
    pub fn build_change_set(
        &self,
        dest: RepoId,
        since: Revision,
        local_sync_first: bool,
        path_prefix: &RepoPath,
    ) -> CoreResult<ChangeSet> {
        if local_sync_first {
            self.scan()?;
        }

        // Snapshot-ordering discipline: clock first, then query.
        let rev = self.store().write_transaction(|txn| {
            let rev = txn.snapshot().local().revision;
            txn.update_last_sync_to(dest, |w| w.revision_in_progress = rev);
            Ok(rev)
        })?;

        self.store().read(|state| -> CoreResult<ChangeSet> {
            let watermark = if since >= 0 {
                since
            } else {
                state.last_sync_to(dest).revision_synced
            };
            let descriptor = RepositoryDescriptor::new(
                state.local().id,
                state.local().public_key.clone(),
                rev,
            );
            let mut set = ChangeSet::empty(descriptor);

            for row in state.modifications_for(dest) {
                if row.revision <= watermark || row.revision > rev {
                    continue;
                }
                match &row.data {
                    ModificationData::Delete { path, length, sha1 } => {
                        if let Some(rel) = path.strip_prefix(path_prefix) {
                            set.modifications
                                .push(ModificationDto::delete(row.revision, rel, *length, *sha1));
                        } else if path_prefix.starts_with(path) {
                            // A delete at or above the subtree root: the
                            // peer's whole mount point vanished.
                            set.modifications.push(ModificationDto::delete(
                                row.revision,
                                RepoPath::root(),
                                None,
                                None,
                            ));
                        }
                    }
                    ModificationData::Copy { from, to } => {
                        if let (Some(from), Some(to)) =
                            (from.strip_prefix(path_prefix), to.strip_prefix(path_prefix))
                        {
                            set.modifications
                                .push(ModificationDto::copy(row.revision, from, to));
                        }
                    }
                }
            }

            let Some(prefix_root) = state.resolve(path_prefix) else {
                let already = set
                    .modifications
                    .iter()
                    .any(|m| m.delete_path().map_or(false, RepoPath::is_root));
                if !already {
                    set.modifications
                        .push(ModificationDto::delete(rev, RepoPath::root(), None, None));
                }
                debug!(%path_prefix, "subtree root gone; emitting root delete");
                return Ok(set);
            };

            // Changed rows under the prefix, true = carries content.
            let mut included: HashMap<RepoId, bool> = HashMap::new();
            for file in state.files() {
                if file.last_local_revision <= watermark || file.last_local_revision > rev {
                    continue;
                }
                if file.is_in_progress() {
                    continue;
                }
                // Rows last written by the destination itself would only
                // echo its own changes back.
                if file.last_sync_from == Some(dest) {
                    continue;
                }
                let path = state.path_of(file.id)?;
                if !path.starts_with(path_prefix) {
                    continue;
                }
                included.insert(file.id, true);
                if file.id == prefix_root {
                    continue;
                }
                let mut cursor = file.parent;
                while let Some(ancestor) = cursor {
                    included.entry(ancestor).or_insert(false);
                    if ancestor == prefix_root {
                        break;
                    }
                    cursor = state.file(ancestor).and_then(|f| f.parent);
                }
            }

            let mut ordered: Vec<(usize, RepoPath, RepoId, bool)> = Vec::new();
            for (&id, &is_content) in &included {
                let path = state.path_of(id)?;
                ordered.push((path.depth(), path, id, is_content));
            }
            ordered.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

            for (_, _, id, is_content) in ordered {
                let Some(file) = state.file(id) else { continue };
                let parent_override = if id == prefix_root { Some(None) } else { None };
                let mut dto = file.to_dto(parent_override);
                if !is_content {
                    dto = dto.as_parent_only();
                }
                set.files.push(dto);
            }
            Ok(set)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfig;
    use repsync_proto::{RepoFileKindDto, REVISION_NONE};
    use std::fs;

    fn replica() -> (tempfile::TempDir, Replica) {
        let tmp = tempfile::tempdir().unwrap();
        let replica = Replica::init(tmp.path().join("repo"), ReplicaConfig::default()).unwrap();
        (tmp, replica)
    }

    fn path(s: &str) -> RepoPath {
        RepoPath::parse(s).unwrap()
    }

    fn root() -> RepoPath {
        RepoPath::root()
    }

    #[test]
    fn fresh_repository_exports_whole_tree() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();
        fs::create_dir(replica.root().join("1")).unwrap();
        fs::write(replica.root().join("1/a"), b"aa").unwrap();
        fs::write(replica.root().join("1/b"), b"bb").unwrap();
        replica.scan().unwrap();

        let set = replica
            .build_change_set(dest, REVISION_NONE, false, &root())
            .unwrap();
        set.verify().unwrap();

        // Root, /1, /1/a, /1/b.
        assert_eq!(set.files.len(), 4);
        assert!(set.files[0].is_root());
        assert_eq!(set.descriptor.revision, replica.store().read(|s| s.local().revision));
    }

    #[test]
    fn unchanged_ancestors_flagged_parent_only() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();
        fs::create_dir(replica.root().join("1")).unwrap();
        fs::write(replica.root().join("1/a"), b"v1").unwrap();
        replica.scan().unwrap();

        // Everything up to now is synced.
        let synced = replica.store().read(|s| s.local().revision);

        fs::write(replica.root().join("1/a"), b"v2!").unwrap();
        replica.scan().unwrap();

        let set = replica
            .build_change_set(dest, synced, false, &root())
            .unwrap();
        set.verify().unwrap();

        assert_eq!(set.files.len(), 3);
        let by_name: Vec<(&str, bool)> = set
            .files
            .iter()
            .map(|f| (f.name.as_str(), f.needed_as_parent))
            .collect();
        assert_eq!(by_name, [("", true), ("1", true), ("a", false)]);
    }

    #[test]
    fn watermark_filters_everything() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();
        fs::write(replica.root().join("f"), b"x").unwrap();
        replica.scan().unwrap();

        let rev = replica.store().read(|s| s.local().revision);
        let set = replica.build_change_set(dest, rev, false, &root()).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn in_progress_files_are_excluded() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();
        let peer = RepoId::new();

        replica.begin_put_file(peer, &path("/half")).unwrap();
        replica.put_file_data(&path("/half"), 0, b"partial").unwrap();

        let set = replica
            .build_change_set(dest, REVISION_NONE, false, &root())
            .unwrap();
        assert!(set.files.iter().all(|f| f.name != "half"));

        // Completing the transfer makes it visible.
        replica
            .end_put_file(peer, &path("/half"), 1000, 7, None)
            .unwrap();
        let set = replica
            .build_change_set(dest, REVISION_NONE, false, &root())
            .unwrap();
        assert!(set.files.iter().any(|f| f.name == "half"));
    }

    #[test]
    fn build_advances_in_flight_watermark_first() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();

        let set = replica
            .build_change_set(dest, REVISION_NONE, false, &root())
            .unwrap();
        let w = replica.store().read(|s| s.last_sync_to(dest));
        assert_eq!(w.revision_in_progress, set.descriptor.revision);
        assert_eq!(w.revision_synced, REVISION_NONE);
    }

    #[test]
    fn delete_modifications_after_watermark_included_in_order() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();
        replica.request_connection(dest, &[1]).unwrap();

        fs::write(replica.root().join("a"), b"1").unwrap();
        fs::write(replica.root().join("b"), b"2").unwrap();
        replica.scan().unwrap();
        replica.delete(None, &path("/a")).unwrap();
        replica.delete(None, &path("/b")).unwrap();

        let set = replica
            .build_change_set(dest, REVISION_NONE, false, &root())
            .unwrap();
        assert_eq!(set.modifications.len(), 2);
        assert!(set.modifications[0].revision < set.modifications[1].revision);
    }

    #[test]
    fn prefix_scopes_and_rebases() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();
        fs::create_dir_all(replica.root().join("sub/tree")).unwrap();
        fs::write(replica.root().join("sub/tree/f"), b"x").unwrap();
        fs::write(replica.root().join("outside"), b"y").unwrap();
        replica.scan().unwrap();

        let prefix = path("/sub/tree");
        let set = replica
            .build_change_set(dest, REVISION_NONE, false, &prefix)
            .unwrap();
        set.verify().unwrap();

        // The subtree root is a virtual root; nothing outside leaks in.
        assert_eq!(set.files.len(), 2);
        assert!(set.files[0].is_root());
        assert!(set.files[0].name.is_empty());
        assert_eq!(set.files[1].name, "f");
        assert!(matches!(
            set.files[1].kind,
            RepoFileKindDto::NormalFile { length: 1, .. }
        ));
    }

    #[test]
    fn deleted_prefix_root_emits_root_delete() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();
        replica.request_connection(dest, &[1]).unwrap();
        fs::create_dir(replica.root().join("mount")).unwrap();
        replica.scan().unwrap();
        replica.delete(None, &path("/mount")).unwrap();

        let set = replica
            .build_change_set(dest, REVISION_NONE, false, &path("/mount"))
            .unwrap();
        assert!(set.files.is_empty());
        assert_eq!(set.modifications.len(), 1);
        assert!(set.modifications[0].delete_path().unwrap().is_root());
    }

    #[test]
    fn rows_from_destination_are_not_echoed() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();

        // A file applied on behalf of `dest` via the transfer protocol.
        replica.begin_put_file(dest, &path("/theirs")).unwrap();
        replica.put_file_data(&path("/theirs"), 0, b"payload").unwrap();
        replica
            .end_put_file(dest, &path("/theirs"), 1000, 7, None)
            .unwrap();

        let set = replica
            .build_change_set(dest, REVISION_NONE, false, &root())
            .unwrap();
        assert!(set.files.iter().all(|f| f.name != "theirs"));

        // A third peer still receives it.
        let other = RepoId::new();
        let set = replica
            .build_change_set(other, REVISION_NONE, false, &root())
            .unwrap();
        assert!(set.files.iter().any(|f| f.name == "theirs"));
    }

    #[test]
    fn reapplying_builder_is_stable() {
        let (_tmp, replica) = replica();
        let dest = RepoId::new();
        fs::write(replica.root().join("f"), b"x").unwrap();
        replica.scan().unwrap();

        let a = replica
            .build_change_set(dest, REVISION_NONE, false, &root())
            .unwrap();
        let b = replica
            .build_change_set(dest, REVISION_NONE, false, &root())
            .unwrap();
        assert_eq!(a.files, b.files);
        assert_eq!(a.modifications, b.modifications);
    }
}
