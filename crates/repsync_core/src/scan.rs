//! Local filesystem scan.
//!
//! Walks the worktree, reconciles it against the metadata store and
//! stamps every detected change with one transaction revision. Local
//! deletions produce modification records for every known peer. Rows
//! with an open transfer are left alone so a resumable upload is never
//! clobbered by a scan.

use crate::config::META_DIR_NAME;
use crate::error::{CoreError, CoreResult};
use crate::fsutil;
use crate::model::{RepoFile, RepoFileKind};
use crate::replica::Replica;
use repsync_proto::{RepoId, RepoPath, TimestampMs};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Counters reported by a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Newly tracked entities.
    pub added: usize,
    /// Entities with changed content, target or timestamp.
    pub updated: usize,
    /// Entities (subtree roots) that vanished from the worktree.
    pub removed: usize,
}

impl ScanReport {
    /// Returns true when the scan found no changes.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

#[derive(Debug)]
enum FsEntry {
    Dir,
    File { length: u64, mtime: TimestampMs },
    Symlink { target: String, mtime: TimestampMs },
}

impl Replica {
    /// Reconciles the worktree against the metadata store.
    pub fn scan(&self) -> CoreResult<ScanReport> {
        let fs_map = self.snapshot_worktree()?;
        let report = self.store().write_transaction(|txn| {
            let mut report = ScanReport::default();

            // Worktree entries, parents before children.
            for (path, entry) in &fs_map {
                match txn.snapshot().resolve(path) {
                    None => {
                        self.insert_scanned(txn, path, entry)?;
                        report.added += 1;
                    }
                    Some(id) => {
                        let row = match txn.snapshot().file(id) {
                            Some(row) => row.clone(),
                            None => continue,
                        };
                        if row.is_in_progress() {
                            continue;
                        }
                        if self.update_scanned(txn, id, &row, path, entry)? {
                            report.updated += 1;
                        }
                    }
                }
            }

            // Store rows that vanished from the worktree, topmost first.
            let mut rows: Vec<(RepoId, RepoPath)> = Vec::new();
            {
                let state = txn.snapshot();
                for file in state.files() {
                    if file.parent.is_some() {
                        rows.push((file.id, state.path_of(file.id)?));
                    }
                }
            }
            rows.sort_by_key(|(_, path)| path.depth());
            for (id, path) in rows {
                if txn.snapshot().file(id).is_none() || fs_map.contains_key(&path) {
                    continue;
                }
                let row = match txn.snapshot().file(id) {
                    Some(row) => row.clone(),
                    None => continue,
                };
                if row.is_in_progress() {
                    continue;
                }
                txn.remove_subtree(id)?;
                Self::record_delete(txn, None, &path, &row);
                debug!(%path, "scan removed vanished entity");
                report.removed += 1;
            }

            Ok(report)
        })?;
        if !report.is_clean() {
            debug!(?report, "scan applied local changes");
        }
        Ok(report)
    }

    fn snapshot_worktree(&self) -> CoreResult<BTreeMap<RepoPath, FsEntry>> {
        let mut map = BTreeMap::new();
        let walker = WalkDir::new(self.root())
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == META_DIR_NAME));

        for entry in walker {
            let entry = entry.map_err(|e| {
                CoreError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed")),
                )
            })?;
            let rel = match entry.path().strip_prefix(self.root()) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let mut segments = Vec::new();
            let mut valid = true;
            for component in rel.components() {
                match component.as_os_str().to_str() {
                    Some(s) => segments.push(s.to_string()),
                    None => {
                        valid = false;
                        break;
                    }
                }
            }
            if !valid {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
                continue;
            }
            let path = RepoPath::from_segments(segments)?;

            let file_type = entry.file_type();
            let fs_entry = if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                FsEntry::Symlink {
                    target: target.to_string_lossy().into_owned(),
                    mtime: modified_ms(entry.path())?,
                }
            } else if file_type.is_dir() {
                FsEntry::Dir
            } else {
                let meta = fs::symlink_metadata(entry.path())?;
                FsEntry::File {
                    length: meta.len(),
                    mtime: meta
                        .modified()
                        .map(fsutil::system_time_ms)
                        .unwrap_or_else(|_| fsutil::now_ms()),
                }
            };
            map.insert(path, fs_entry);
        }
        Ok(map)
    }

    fn insert_scanned(
        &self,
        txn: &mut crate::store::WriteTxn<'_>,
        path: &RepoPath,
        entry: &FsEntry,
    ) -> CoreResult<()> {
        let parent_path = path
            .parent()
            .ok_or_else(|| CoreError::structural("scan entry at root"))?;
        let parent = txn
            .snapshot()
            .resolve(&parent_path)
            .ok_or_else(|| CoreError::ParentNotFound { path: path.clone() })?;
        let name = path
            .name()
            .ok_or_else(|| CoreError::structural("scan entry at root"))?
            .to_string();
        let now = fsutil::now_ms();
        let (kind, last_modified) = match entry {
            FsEntry::Dir => (RepoFileKind::Directory, now),
            FsEntry::File { mtime, .. } => {
                let (length, sha1, chunks) =
                    fsutil::hash_file(&self.fs_path(path), self.config().chunk_size)?;
                (
                    RepoFileKind::NormalFile {
                        length,
                        sha1,
                        chunks,
                        in_progress: false,
                    },
                    *mtime,
                )
            }
            FsEntry::Symlink { target, mtime } => (
                RepoFileKind::Symlink {
                    target: target.clone(),
                },
                *mtime,
            ),
        };
        txn.insert_file(RepoFile {
            id: RepoId::new(),
            parent: Some(parent),
            name,
            last_local_revision: 0,
            last_modified,
            created: now,
            last_sync_from: None,
            kind,
        })?;
        Ok(())
    }

    /// Reconciles one tracked row against its worktree entry.
    ///
    /// Returns true when the row changed. A kind change (file became a
    /// directory, ...) is a delete of the old entity plus an insert of a
    /// new one — ids are never reused across identities.
    fn update_scanned(
        &self,
        txn: &mut crate::store::WriteTxn<'_>,
        id: RepoId,
        row: &RepoFile,
        path: &RepoPath,
        entry: &FsEntry,
    ) -> CoreResult<bool> {
        match (&row.kind, entry) {
            (RepoFileKind::Directory, FsEntry::Dir) => Ok(false),
            (
                RepoFileKind::NormalFile {
                    length: row_len,
                    sha1: row_sha1,
                    ..
                },
                FsEntry::File { length, mtime },
            ) => {
                if *row_len == *length && *mtime == row.last_modified {
                    return Ok(false);
                }
                let (new_len, new_sha1, chunks) =
                    fsutil::hash_file(&self.fs_path(path), self.config().chunk_size)?;
                if new_len == *row_len && new_sha1 == *row_sha1 {
                    // Content unchanged; mirror the new timestamp.
                    txn.update_file(id, |f| {
                        f.last_modified = *mtime;
                        f.last_sync_from = None;
                    })?;
                } else {
                    txn.update_file(id, |f| {
                        f.kind = RepoFileKind::NormalFile {
                            length: new_len,
                            sha1: new_sha1,
                            chunks,
                            in_progress: false,
                        };
                        f.last_modified = *mtime;
                        f.last_sync_from = None;
                    })?;
                }
                Ok(true)
            }
            (
                RepoFileKind::Symlink { target: row_target },
                FsEntry::Symlink { target, mtime },
            ) => {
                if row_target == target && *mtime == row.last_modified {
                    return Ok(false);
                }
                let target = target.clone();
                let mtime = *mtime;
                txn.update_file(id, |f| {
                    f.kind = RepoFileKind::Symlink { target };
                    f.last_modified = mtime;
                    f.last_sync_from = None;
                })?;
                Ok(true)
            }
            _ => {
                txn.remove_subtree(id)?;
                Self::record_delete(txn, None, path, row);
                self.insert_scanned(txn, path, entry)?;
                Ok(true)
            }
        }
    }
}

fn modified_ms(path: &std::path::Path) -> CoreResult<TimestampMs> {
    let meta = fs::symlink_metadata(path)?;
    Ok(meta
        .modified()
        .map(fsutil::system_time_ms)
        .unwrap_or_else(|_| fsutil::now_ms()))
}
