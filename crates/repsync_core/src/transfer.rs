//! Chunked file-transfer state machine: begin, put ranges, end.
//!
//! A transfer flows `begin_put_file` → any number of `put_file_data`
//! calls (out-of-order and overlapping ranges are legal, so a peer can
//! resume or retry freely) → `end_put_file`. Collision detection runs
//! exactly once per logical transfer, in `begin_put_file`; invoking it
//! again for a path already in progress from the same peer is a resume,
//! not a new collision. Between begin and end the file is flagged
//! in-progress and excluded from outgoing change sets, so half-written
//! data never propagates.

use crate::collision::{self, resolve_by_rename};
use crate::error::{CoreError, CoreResult};
use crate::fsutil;
use crate::model::{RepoFile, RepoFileKind};
use crate::replica::Replica;
use repsync_proto::{RepoId, RepoPath, Sha1Hash, TimestampMs};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use tracing::{debug, warn};

/// How `begin_put_file` disposed of the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginPutOutcome {
    /// A fresh entity was created; the caller must transfer every chunk.
    Fresh,
    /// An existing, fully transferred file is updated in place; its
    /// stored chunk table still matches the bytes on disk, so matching
    /// chunks may be skipped.
    Reused,
    /// An interrupted transfer from the same peer resumes. The stored
    /// chunk table is stale; every chunk must be transferred again.
    Resumed,
}

impl Replica {
    /// Opens a transfer into `path` on behalf of peer `from`.
    pub fn begin_put_file(
        &self,
        from: RepoId,
        path: &RepoPath,
    ) -> CoreResult<BeginPutOutcome> {
        self.store().write_transaction(|txn| {
            collision::check_pending_delete(txn.snapshot(), from, path)?;

            if let Some(id) = txn.snapshot().resolve(path) {
                let file = txn
                    .snapshot()
                    .file(id)
                    .cloned()
                    .ok_or_else(|| CoreError::structural("resolved row disappeared"))?;

                if file.is_in_progress() && file.last_sync_from == Some(from) {
                    debug!(%path, "transfer resumed");
                    return Ok(BeginPutOutcome::Resumed);
                }

                if file.is_directory() || collision::is_collision(txn.snapshot(), from, &file) {
                    // Directories are never overwritten by a file body;
                    // either way the local version is preserved aside.
                    resolve_by_rename(self.root(), self.config(), txn, id)?;
                } else if file.is_symlink() {
                    // The peer saw this symlink; replace it.
                    std::fs::remove_file(self.fs_path(path))?;
                    txn.remove_subtree(id)?;
                } else {
                    txn.update_file(id, |f| {
                        if let RepoFileKind::NormalFile { in_progress, .. } = &mut f.kind {
                            *in_progress = true;
                        }
                        f.last_sync_from = Some(from);
                    })?;
                    return Ok(BeginPutOutcome::Reused);
                }
            }

            self.create_in_progress(txn, from, path)?;
            Ok(BeginPutOutcome::Fresh)
        })
    }

    fn create_in_progress(
        &self,
        txn: &mut crate::store::WriteTxn<'_>,
        from: RepoId,
        path: &RepoPath,
    ) -> CoreResult<()> {
        let parent_path = path
            .parent()
            .ok_or_else(|| CoreError::structural("file transfer targets the tree root"))?;
        let parent = txn
            .snapshot()
            .resolve(&parent_path)
            .ok_or_else(|| CoreError::ParentNotFound { path: path.clone() })?;
        let name = path
            .name()
            .ok_or_else(|| CoreError::structural("file transfer targets the tree root"))?;

        let fs_path = self.fs_path(path);
        if fs_path.exists() || std::fs::symlink_metadata(&fs_path).is_ok() {
            // An untracked worktree entry occupies the path; preserve it
            // for the next scan rather than truncating it.
            let aside = format!("{name}{}{}", collision::COLLISION_MARKER, RepoId::new().short_hex());
            warn!(%path, aside, "untracked entry at transfer target preserved");
            std::fs::rename(&fs_path, fs_path.with_file_name(aside))?;
        }
        File::create(&fs_path)?;

        let now = fsutil::now_ms();
        txn.insert_file(RepoFile {
            id: RepoId::new(),
            parent: Some(parent),
            name: name.to_string(),
            last_local_revision: 0,
            last_modified: now,
            created: now,
            last_sync_from: Some(from),
            kind: RepoFileKind::NormalFile {
                length: 0,
                sha1: Sha1Hash::digest(b""),
                chunks: Vec::new(),
                in_progress: true,
            },
        })?;
        Ok(())
    }

    /// Writes a byte range into an open transfer.
    ///
    /// Legal only while the file is in progress. No metadata transaction
    /// is involved; only the worktree bytes change.
    pub fn put_file_data(&self, path: &RepoPath, offset: u64, data: &[u8]) -> CoreResult<()> {
        let open = self
            .store()
            .resolve_path(path)
            .map(|id| {
                self.store()
                    .read(|s| s.file(id).map(RepoFile::is_in_progress).unwrap_or(false))
            })
            .unwrap_or(false);
        if !open {
            return Err(CoreError::InvalidFileState {
                path: path.clone(),
                message: "no transfer in progress".to_string(),
            });
        }
        let mut file = OpenOptions::new().write(true).open(self.fs_path(path))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Completes a transfer: truncates or extends to `length`, stamps the
    /// timestamp, recomputes the content hash and chunk table and clears
    /// the in-progress flag.
    ///
    /// The advisory `sha1` is compared against the recomputed hash; a
    /// mismatch is logged, not fatal — the source file may have
    /// legitimately changed mid-transfer and the transferred bytes win.
    pub fn end_put_file(
        &self,
        from: RepoId,
        path: &RepoPath,
        last_modified: TimestampMs,
        length: u64,
        sha1: Option<Sha1Hash>,
    ) -> CoreResult<()> {
        self.store().write_transaction(|txn| {
            let id = txn
                .snapshot()
                .resolve(path)
                .ok_or_else(|| CoreError::EntityNotFound { path: path.clone() })?;
            let file = txn
                .snapshot()
                .file(id)
                .cloned()
                .ok_or_else(|| CoreError::structural("resolved row disappeared"))?;
            if !file.is_in_progress() || file.last_sync_from != Some(from) {
                return Err(CoreError::InvalidFileState {
                    path: path.clone(),
                    message: "no transfer in progress from this peer".to_string(),
                });
            }

            let fs_path = self.fs_path(path);
            {
                let file = OpenOptions::new().write(true).open(&fs_path)?;
                file.set_len(length)?;
                file.sync_all()?;
            }
            let (actual_length, actual_sha1, chunks) =
                fsutil::hash_file(&fs_path, self.config().chunk_size)?;
            if let Some(advisory) = sha1 {
                if advisory != actual_sha1 {
                    warn!(
                        %path,
                        advisory = %advisory,
                        actual = %actual_sha1,
                        "content hash mismatch after transfer; stored bytes win"
                    );
                }
            }
            fsutil::set_mtime(&fs_path, last_modified)?;
            txn.update_file(id, |f| {
                f.kind = RepoFileKind::NormalFile {
                    length: actual_length,
                    sha1: actual_sha1,
                    chunks,
                    in_progress: false,
                };
                f.last_modified = last_modified;
                f.last_sync_from = Some(from);
            })?;
            Ok(())
        })
    }
}
