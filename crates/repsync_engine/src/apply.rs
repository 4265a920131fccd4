//! Applies a peer's change set to the local replica.
//!
//! Ordering: modifications first, in revision order (a recorded delete
//! must be visible before any new entry at that path is considered),
//! then file entries, parents before children. Every step is idempotent:
//! at-least-once delivery means a retried session replays an overlapping
//! change set, and replaying must be a no-op.

use crate::error::{SyncError, SyncResult};
use crate::transport::RepoTransport;
use repsync_core::{model::FileChunk, BeginPutOutcome, Replica};
use repsync_proto::{
    ChangeSet, FileChunkDto, ModificationData, RepoFileDto, RepoFileKindDto, RepoId, RepoPath,
    Sha1Hash, TimestampMs,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Counters for one applied change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Modification records applied.
    pub modifications: u64,
    /// File entries applied (including cheap no-op re-applications).
    pub files: u64,
    /// Items skipped for a later pass (pending-delete races, files that
    /// changed on the peer mid-transfer).
    pub skipped: u64,
}

impl ApplyStats {
    fn merge_skip(&mut self, path: &RepoPath, error: &SyncError) {
        warn!(%path, %error, "item skipped; will retry on a later pass");
        self.skipped += 1;
    }
}

/// Applies `set` (received from `peer`) to `local`, fetching file bodies
/// through `transport`. `local_prefix` is the local subtree the
/// connection is scoped to.
pub fn apply_change_set(
    local: &Replica,
    peer: RepoId,
    set: &ChangeSet,
    transport: &dyn RepoTransport,
    local_prefix: &RepoPath,
    cancelled: &AtomicBool,
) -> SyncResult<ApplyStats> {
    set.verify()
        .map_err(|e| SyncError::StructuralInvariant(e.to_string()))?;

    let mut stats = ApplyStats::default();

    for modification in &set.modifications {
        check_cancelled(cancelled)?;
        let result: SyncResult<()> = match &modification.data {
            ModificationData::Delete { path, .. } => {
                let local_path = local_prefix.join(path);
                local.delete(Some(peer), &local_path).map_err(Into::into)
            }
            ModificationData::Copy { from, to } => local
                .copy_entry(Some(peer), &local_prefix.join(from), &local_prefix.join(to))
                .map_err(Into::into),
        };
        match result {
            Ok(()) => stats.modifications += 1,
            Err(e) if e.is_item_skip() => {
                stats.merge_skip(local_prefix, &e);
            }
            Err(e) => return Err(e),
        }
    }

    // Wire paths reconstructed from the parent chain; the builder
    // guarantees parents come first.
    let mut wire_paths: HashMap<RepoId, RepoPath> = HashMap::new();
    for entry in &set.files {
        check_cancelled(cancelled)?;
        let wire_path = match entry.parent_id {
            None => RepoPath::root(),
            Some(parent) => {
                let parent_path = wire_paths.get(&parent).ok_or_else(|| {
                    SyncError::StructuralInvariant(format!(
                        "entry {} has unresolved parent {parent}",
                        entry.id
                    ))
                })?;
                parent_path
                    .child(&entry.name)
                    .map_err(|e| SyncError::Protocol(e.to_string()))?
            }
        };
        wire_paths.insert(entry.id, wire_path.clone());
        let local_path = local_prefix.join(&wire_path);

        let result = apply_entry(local, peer, transport, entry, &wire_path, &local_path);
        match result {
            Ok(true) => stats.files += 1,
            Ok(false) => stats.skipped += 1,
            Err(e) if e.is_item_skip() => stats.merge_skip(&local_path, &e),
            Err(e) => return Err(e),
        }
    }

    Ok(stats)
}

fn apply_entry(
    local: &Replica,
    peer: RepoId,
    transport: &dyn RepoTransport,
    entry: &RepoFileDto,
    wire_path: &RepoPath,
    local_path: &RepoPath,
) -> SyncResult<bool> {
    match &entry.kind {
        RepoFileKindDto::Directory => {
            // Ancestor-closure entries only resolve paths; they carry no
            // timestamp update.
            let last_modified = if entry.needed_as_parent {
                None
            } else {
                Some(entry.last_modified)
            };
            local.make_directory(Some(peer), local_path, last_modified)?;
            Ok(true)
        }
        RepoFileKindDto::Symlink { target } => {
            local.make_symlink(Some(peer), local_path, target, Some(entry.last_modified))?;
            Ok(true)
        }
        RepoFileKindDto::NormalFile {
            length,
            sha1,
            chunks,
        } => pull_file(
            local,
            peer,
            transport,
            wire_path,
            local_path,
            *length,
            *sha1,
            chunks,
            entry.last_modified,
        ),
    }
}

/// Fetches one file body through the transfer protocol.
///
/// Chunks whose hash matches the local file's stored chunk table are not
/// fetched. Returns `Ok(false)` when the peer's copy changed or vanished
/// mid-transfer: the local file stays in progress (excluded from
/// outgoing change sets) until a later pass resumes it.
#[allow(clippy::too_many_arguments)]
fn pull_file(
    local: &Replica,
    peer: RepoId,
    transport: &dyn RepoTransport,
    wire_path: &RepoPath,
    local_path: &RepoPath,
    length: u64,
    sha1: Sha1Hash,
    chunks: &[FileChunkDto],
    last_modified: TimestampMs,
) -> SyncResult<bool> {
    // Identical local state: nothing to transfer, nothing to stamp.
    let (up_to_date, local_chunks) = local.store().read(|s| {
        match s.resolve(local_path).and_then(|id| s.file(id)) {
            Some(file) if !file.is_in_progress() => {
                let same = file.content() == Some((length, sha1))
                    && file.last_modified == last_modified;
                (same, file.chunks().map(<[FileChunk]>::to_vec))
            }
            _ => (false, None),
        }
    });
    if up_to_date {
        return Ok(true);
    }

    let outcome = local.begin_put_file(peer, local_path)?;
    let reusable: &[FileChunk] = match (outcome, &local_chunks) {
        // Only a fully transferred file still matches its chunk table.
        (BeginPutOutcome::Reused, Some(chunks)) => chunks,
        _ => &[],
    };

    for chunk in chunks {
        let matches_local = reusable.iter().any(|c| {
            c.offset == chunk.offset && c.length == chunk.length && c.sha1 == chunk.sha1
        });
        if matches_local {
            continue;
        }
        let data = transport.get_file_data(wire_path, chunk.offset, chunk.length)?;
        let Some(data) = data else {
            debug!(path = %wire_path, "source vanished mid-transfer; leaving file in progress");
            return Ok(false);
        };
        if data.len() != chunk.length as usize {
            debug!(path = %wire_path, "short read; source changed mid-transfer");
            return Ok(false);
        }
        local.put_file_data(local_path, chunk.offset, &data)?;
    }

    local.end_put_file(peer, local_path, last_modified, length, Some(sha1))?;
    Ok(true)
}

fn check_cancelled(cancelled: &AtomicBool) -> SyncResult<()> {
    if cancelled.load(Ordering::SeqCst) {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use repsync_core::ReplicaConfig;
    use repsync_proto::{RepositoryDescriptor, REVISION_NONE};
    use std::fs;
    use std::sync::Arc;

    fn replica(name: &str, tmp: &tempfile::TempDir) -> Arc<Replica> {
        Arc::new(Replica::init(tmp.path().join(name), ReplicaConfig::default()).unwrap())
    }

    fn transport_to(peer: &Arc<Replica>, client: &Arc<Replica>) -> LocalTransport {
        LocalTransport::connect(
            Arc::clone(peer),
            RepositoryDescriptor::new(client.id(), vec![], 1),
            RepoPath::root(),
        )
        .unwrap()
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let a = replica("a", &tmp);
        let b = replica("b", &tmp);

        fs::create_dir(a.root().join("1")).unwrap();
        fs::write(a.root().join("1/a"), b"alpha").unwrap();
        a.scan().unwrap();

        let transport = transport_to(&a, &b);
        let set = transport.get_change_set(false, REVISION_NONE).unwrap();
        let cancelled = AtomicBool::new(false);

        let first =
            apply_change_set(&b, a.id(), &set, &transport, &RepoPath::root(), &cancelled).unwrap();
        assert_eq!(first.skipped, 0);
        let revision_after_first = b.store().read(|s| s.local().revision);

        let second =
            apply_change_set(&b, a.id(), &set, &transport, &RepoPath::root(), &cancelled).unwrap();
        assert_eq!(second.skipped, 0);

        // Replaying changed nothing: same revision, same tree.
        assert_eq!(b.store().read(|s| s.local().revision), revision_after_first);
        assert_eq!(
            fs::read(b.root().join("1/a")).unwrap(),
            b"alpha".to_vec()
        );
    }

    #[test]
    fn chunk_reuse_skips_matching_ranges() {
        let tmp = tempfile::tempdir().unwrap();
        let a = replica("a", &tmp);
        let b = replica("b", &tmp);

        fs::write(a.root().join("f"), b"same-bytes").unwrap();
        fs::write(b.root().join("f"), b"same-bytes").unwrap();
        a.scan().unwrap();
        b.scan().unwrap();

        // Align the timestamps so only the hashes decide.
        let mtime = a.store().read(|s| {
            let id = s.resolve(&RepoPath::parse("/f").unwrap()).unwrap();
            s.file(id).unwrap().last_modified
        });
        filetime::set_file_mtime(
            b.root().join("f"),
            filetime::FileTime::from_unix_time(mtime / 1000, (mtime % 1000) as u32 * 1_000_000),
        )
        .unwrap();
        b.scan().unwrap();

        let transport = transport_to(&a, &b);
        let set = transport.get_change_set(false, REVISION_NONE).unwrap();
        let cancelled = AtomicBool::new(false);
        let stats =
            apply_change_set(&b, a.id(), &set, &transport, &RepoPath::root(), &cancelled).unwrap();

        assert_eq!(stats.skipped, 0);
        assert_eq!(fs::read(b.root().join("f")).unwrap(), b"same-bytes");
    }

    #[test]
    fn cancellation_stops_between_items() {
        let tmp = tempfile::tempdir().unwrap();
        let a = replica("a", &tmp);
        let b = replica("b", &tmp);

        fs::write(a.root().join("f"), b"x").unwrap();
        a.scan().unwrap();

        let transport = transport_to(&a, &b);
        let set = transport.get_change_set(false, REVISION_NONE).unwrap();
        let cancelled = AtomicBool::new(true);

        let result = apply_change_set(&b, a.id(), &set, &transport, &RepoPath::root(), &cancelled);
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[test]
    fn malformed_set_aborts_before_any_apply() {
        let tmp = tempfile::tempdir().unwrap();
        let a = replica("a", &tmp);
        let b = replica("b", &tmp);

        let transport = transport_to(&a, &b);
        let mut set = transport.get_change_set(false, REVISION_NONE).unwrap();
        // Orphan entry: parent not part of the set.
        set.files.push(RepoFileDto::directory(
            RepoId::new(),
            Some(RepoId::new()),
            "orphan",
            1,
            0,
        ));

        let cancelled = AtomicBool::new(false);
        let result = apply_change_set(&b, a.id(), &set, &transport, &RepoPath::root(), &cancelled);
        assert!(matches!(result, Err(SyncError::StructuralInvariant(_))));
    }
}
