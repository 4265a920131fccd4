//! Collision detection and preservation-by-rename resolution.
//!
//! Every mutating operation applied on behalf of a peer runs the gate
//! before touching an existing entity. A collision means the entity
//! changed locally after the last state the peer has provably received;
//! the resolution renames the local version to a sibling collision file —
//! never overwrites, never deletes — so both versions survive and the
//! collision file syncs outward as a new, regular entity on the next
//! exchange.

use crate::config::ReplicaConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{RepoFile, RepoFileKind};
use crate::store::{StoreState, WriteTxn};
use repsync_proto::{ModificationData, RepoId, RepoPath, Revision};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Infix appended to a name when preserving a colliding entity.
pub const COLLISION_MARKER: &str = ".collision-";

/// The local revision peer `from` has provably received from us.
///
/// An entity stamped at or below this value cannot have diverged from
/// what the peer last saw.
pub(crate) fn sync_watermark(state: &StoreState, from: RepoId) -> Revision {
    state.last_sync_to(from).revision_synced
}

/// Returns true when `file` diverged locally since peer `from` last saw it.
pub(crate) fn is_collision(state: &StoreState, from: RepoId, file: &RepoFile) -> bool {
    if file.last_local_revision <= sync_watermark(state, from) {
        return false;
    }
    // A resumed or retried transfer from the same source is not a
    // third-party edit.
    file.last_sync_from != Some(from)
}

/// Returns true when any entity in the subtree rooted at `root` collides.
pub(crate) fn subtree_collides(state: &StoreState, from: RepoId, root: RepoId) -> bool {
    state
        .descendants(root)
        .into_iter()
        .filter_map(|id| state.file(id))
        .any(|file| is_collision(state, from, file))
}

/// Checks an incoming write against pending deletes recorded for `from`.
///
/// A delete at `path` or any of its ancestors, recorded after the peer's
/// last-synced watermark, means the write races with a deletion the peer
/// has not yet seen. The single operation fails; the caller retries the
/// item on a later pass once the tree has settled.
pub(crate) fn check_pending_delete(
    state: &StoreState,
    from: RepoId,
    path: &RepoPath,
) -> CoreResult<()> {
    let watermark = sync_watermark(state, from);
    let pending = state.modifications_for(from).into_iter().any(|m| {
        m.revision > watermark
            && matches!(&m.data, ModificationData::Delete { path: deleted, .. }
                if path.starts_with(deleted))
    });
    if pending {
        return Err(CoreError::DeleteModificationCollision { path: path.clone() });
    }
    Ok(())
}

/// Picks a collision name for `name` that is free among `parent`'s
/// siblings, warning once the accumulated collision chain passes the
/// configured cap.
fn collision_name(
    state: &StoreState,
    config: &ReplicaConfig,
    parent: RepoId,
    name: &str,
) -> String {
    let prefix = format!("{name}{COLLISION_MARKER}");
    let existing = state
        .children_of(parent)
        .filter(|(sibling, _)| sibling.starts_with(prefix.as_str()))
        .count();
    if existing >= config.max_collision_files {
        warn!(
            name,
            count = existing,
            "collision chain exceeds configured cap; preserving anyway"
        );
    }
    loop {
        let candidate = format!("{prefix}{}", RepoId::new().short_hex());
        if state.child(parent, &candidate).is_none() {
            return candidate;
        }
    }
}

/// Renames the entity at `id` to a sibling collision file.
///
/// The renamed row is stamped with the transaction revision and its
/// `last_sync_from` is cleared, so it becomes a regular local entity that
/// syncs outward on the next exchange. An interrupted transfer caught in
/// a collision is re-hashed from disk and closed, since its stored
/// content metadata no longer matches the bytes.
pub(crate) fn resolve_by_rename(
    worktree: &Path,
    config: &ReplicaConfig,
    txn: &mut WriteTxn<'_>,
    id: RepoId,
) -> CoreResult<RepoPath> {
    let (parent, name, path, was_in_progress) = {
        let state = txn.snapshot();
        let file = state
            .file(id)
            .ok_or_else(|| CoreError::structural(format!("collision rename of missing row {id}")))?;
        let parent = file
            .parent
            .ok_or_else(|| CoreError::structural("the tree root cannot collide"))?;
        (
            parent,
            file.name.clone(),
            state.path_of(id)?,
            file.is_in_progress(),
        )
    };

    let new_name = collision_name(txn.snapshot(), config, parent, &name);
    let new_path = path
        .parent()
        .unwrap_or_else(RepoPath::root)
        .child(&new_name)?;

    fs::rename(path.to_fs_path(worktree), new_path.to_fs_path(worktree))?;
    txn.rename_file(id, parent, &new_name)?;
    // Stamp the whole preserved subtree as a fresh local change so every
    // row under the new name syncs outward, not just the renamed root.
    let subtree = txn.snapshot().descendants(id);
    for row in subtree {
        txn.update_file(row, |f| f.last_sync_from = None)?;
    }

    if was_in_progress {
        let (length, sha1, chunks) =
            crate::fsutil::hash_file(&new_path.to_fs_path(worktree), config.chunk_size)?;
        txn.update_file(id, |f| {
            f.kind = RepoFileKind::NormalFile {
                length,
                sha1,
                chunks,
                in_progress: false,
            };
        })?;
    }

    debug!(from = %path, to = %new_path, "preserved colliding entity");
    Ok(new_path)
}
