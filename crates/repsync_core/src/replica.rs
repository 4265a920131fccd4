//! The replica: a worktree directory paired with its metadata store.
//!
//! All mutating operations take an optional source peer. Operations
//! applied on behalf of a peer run the collision gate before touching
//! existing state; operations of local origin (the scan, the CLI) skip
//! the gate and fan modification records out to every known peer.

use crate::collision::{self, resolve_by_rename};
use crate::config::{ReplicaConfig, META_DIR_NAME};
use crate::error::{CoreError, CoreResult};
use crate::fsutil;
use crate::model::{RemoteRepository, RepoFile, RepoFileKind};
use crate::store::{MetaStore, StoreState, WriteTxn};
use rand::RngCore;
use repsync_proto::{
    ModificationData, RepoId, RepoPath, RepositoryDescriptor, Revision, TimestampMs, REVISION_NONE,
};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A local repository replica.
pub struct Replica {
    root: PathBuf,
    store: MetaStore,
    config: ReplicaConfig,
}

impl Replica {
    /// Initializes a new replica at `root`, creating the worktree
    /// directory and a fresh metadata store with a random identity.
    pub fn init(root: impl AsRef<Path>, config: ReplicaConfig) -> CoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let mut public_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut public_key);
        let id = RepoId::new();
        let store = MetaStore::create(
            &root.join(META_DIR_NAME),
            id,
            public_key,
            config.path_cache_capacity,
        )?;
        info!(repository = %id, root = %root.display(), "initialized repository");
        Ok(Self {
            root,
            store,
            config,
        })
    }

    /// Opens an existing replica at `root`.
    pub fn open(root: impl AsRef<Path>, config: ReplicaConfig) -> CoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let store = MetaStore::open(&root.join(META_DIR_NAME), config.path_cache_capacity)?;
        Ok(Self {
            root,
            store,
            config,
        })
    }

    /// The worktree root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The replica configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// The metadata store.
    #[must_use]
    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    /// The repository id.
    #[must_use]
    pub fn id(&self) -> RepoId {
        self.store.read(|s| s.local().id)
    }

    /// The repository descriptor served to peers.
    #[must_use]
    pub fn descriptor(&self) -> RepositoryDescriptor {
        self.store.read(|s| {
            RepositoryDescriptor::new(s.local().id, s.local().public_key.clone(), s.local().revision)
        })
    }

    pub(crate) fn fs_path(&self, path: &RepoPath) -> PathBuf {
        path.to_fs_path(&self.root)
    }

    // ---- connection and watermark bookkeeping ----

    /// Registers a pending trust request for a peer.
    ///
    /// Idempotent: a known peer is left untouched.
    pub fn request_connection(&self, id: RepoId, public_key: &[u8]) -> CoreResult<()> {
        if id == self.id() {
            return Err(CoreError::structural("repository cannot connect to itself"));
        }
        self.store.write_transaction(|txn| {
            if txn.snapshot().remote(id).is_none() {
                txn.upsert_remote(RemoteRepository::pending(id, public_key.to_vec()));
                info!(peer = %id, "registered connection request");
            }
            Ok(())
        })
    }

    /// Accepts a pending trust request.
    pub fn accept_connection(&self, id: RepoId) -> CoreResult<()> {
        self.store
            .write_transaction(|txn| txn.update_remote(id, |r| r.pending = false))
    }

    /// The highest revision of `peer` fully applied locally.
    #[must_use]
    pub fn remote_revision(&self, peer: RepoId) -> Revision {
        self.store.read(|s| {
            s.remote(peer)
                .map(|r| r.local_revision)
                .unwrap_or(REVISION_NONE)
        })
    }

    /// Records that `peer`'s state up to `revision` is fully applied here.
    ///
    /// Invoked at the end of a down-phase, and on behalf of a peer that
    /// finished pushing to us.
    pub fn set_remote_revision(&self, peer: RepoId, revision: Revision) -> CoreResult<()> {
        self.store.write_transaction(|txn| {
            if txn.snapshot().remote(peer).is_none() {
                txn.upsert_remote(RemoteRepository::pending(peer, Vec::new()));
            }
            txn.update_remote(peer, |r| r.local_revision = revision)
        })
    }

    /// Commits the outgoing watermark for `dest` and garbage-collects the
    /// modification rows it has now confirmed. Idempotent.
    pub fn complete_sync_to(&self, dest: RepoId) -> CoreResult<()> {
        self.store.write_transaction(|txn| {
            txn.update_last_sync_to(dest, |w| w.complete());
            let synced = txn.snapshot().last_sync_to(dest).revision_synced;
            if synced != REVISION_NONE {
                txn.prune_modifications(dest, synced);
            }
            Ok(())
        })
    }

    // ---- tree operations ----

    fn resolve_parent(state: &StoreState, path: &RepoPath) -> CoreResult<RepoId> {
        let parent_path = path
            .parent()
            .ok_or_else(|| CoreError::structural("operation targets the tree root"))?;
        let parent = state
            .resolve(&parent_path)
            .ok_or_else(|| CoreError::ParentNotFound { path: path.clone() })?;
        match state.file(parent) {
            Some(f) if f.is_directory() => Ok(parent),
            _ => Err(CoreError::ParentNotFound { path: path.clone() }),
        }
    }

    fn row(state: &StoreState, id: RepoId) -> CoreResult<RepoFile> {
        state
            .file(id)
            .cloned()
            .ok_or_else(|| CoreError::structural(format!("resolved row {id} disappeared")))
    }

    fn name_of(path: &RepoPath) -> CoreResult<String> {
        path.name()
            .map(str::to_string)
            .ok_or_else(|| CoreError::structural("operation targets the tree root"))
    }

    /// Makes way for an incoming entity of a different shape: colliding
    /// local state is preserved by rename, state the peer has already
    /// seen is removed.
    pub(crate) fn displace(
        &self,
        txn: &mut WriteTxn<'_>,
        source: Option<RepoId>,
        id: RepoId,
        path: &RepoPath,
    ) -> CoreResult<()> {
        let collides = source
            .map(|peer| collision::subtree_collides(txn.snapshot(), peer, id))
            .unwrap_or(false);
        if collides {
            resolve_by_rename(&self.root, &self.config, txn, id)?;
            return Ok(());
        }
        let file = Self::row(txn.snapshot(), id)?;
        let fs_path = self.fs_path(path);
        let removal = if file.is_directory() {
            fs::remove_dir_all(&fs_path)
        } else {
            fs::remove_file(&fs_path)
        };
        match removal {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        txn.remove_subtree(id)?;
        Ok(())
    }

    /// Creates a directory, or updates an existing one's timestamp.
    ///
    /// Idempotent over existing directories: applying the same entry
    /// twice never flags a collision.
    pub fn make_directory(
        &self,
        source: Option<RepoId>,
        path: &RepoPath,
        last_modified: Option<TimestampMs>,
    ) -> CoreResult<()> {
        if path.is_root() {
            // The root always exists.
            return Ok(());
        }
        self.store.write_transaction(|txn| {
            if let Some(peer) = source {
                collision::check_pending_delete(txn.snapshot(), peer, path)?;
            }
            if let Some(id) = txn.snapshot().resolve(path) {
                let file = Self::row(txn.snapshot(), id)?;
                if file.is_directory() {
                    if let Some(ms) = last_modified {
                        if ms != file.last_modified {
                            fsutil::set_mtime(&self.fs_path(path), ms)?;
                            txn.update_file(id, |f| {
                                f.last_modified = ms;
                                f.last_sync_from = source;
                            })?;
                        }
                    }
                    return Ok(());
                }
                self.displace(txn, source, id, path)?;
            }
            let parent = Self::resolve_parent(txn.snapshot(), path)?;
            let fs_path = self.fs_path(path);
            match fs::create_dir(&fs_path) {
                Err(e) if e.kind() != ErrorKind::AlreadyExists => return Err(e.into()),
                _ => {}
            }
            let now = fsutil::now_ms();
            let lm = last_modified.unwrap_or(now);
            txn.insert_file(RepoFile {
                id: RepoId::new(),
                parent: Some(parent),
                name: Self::name_of(path)?,
                last_local_revision: 0,
                last_modified: lm,
                created: now,
                last_sync_from: source,
                kind: RepoFileKind::Directory,
            })?;
            if last_modified.is_some() {
                fsutil::set_mtime(&fs_path, lm)?;
            }
            Ok(())
        })
    }

    /// Creates or retargets a symlink.
    pub fn make_symlink(
        &self,
        source: Option<RepoId>,
        path: &RepoPath,
        target: &str,
        last_modified: Option<TimestampMs>,
    ) -> CoreResult<()> {
        self.store.write_transaction(|txn| {
            if let Some(peer) = source {
                collision::check_pending_delete(txn.snapshot(), peer, path)?;
            }
            if let Some(id) = txn.snapshot().resolve(path) {
                let file = Self::row(txn.snapshot(), id)?;
                match &file.kind {
                    RepoFileKind::Symlink { target: current } if current.as_str() == target => {
                        if let Some(ms) = last_modified {
                            if ms != file.last_modified {
                                fsutil::set_symlink_mtime(&self.fs_path(path), ms)?;
                                txn.update_file(id, |f| {
                                    f.last_modified = ms;
                                    f.last_sync_from = source;
                                })?;
                            }
                        }
                        return Ok(());
                    }
                    RepoFileKind::Symlink { .. }
                        if source
                            .map(|peer| !collision::is_collision(txn.snapshot(), peer, &file))
                            .unwrap_or(true) =>
                    {
                        // Retarget in place; the peer saw the old target.
                        let fs_path = self.fs_path(path);
                        fs::remove_file(&fs_path)?;
                        fsutil::make_symlink(target, &fs_path)?;
                        let lm = last_modified.unwrap_or_else(fsutil::now_ms);
                        fsutil::set_symlink_mtime(&fs_path, lm)?;
                        txn.update_file(id, |f| {
                            f.kind = RepoFileKind::Symlink {
                                target: target.to_string(),
                            };
                            f.last_modified = lm;
                            f.last_sync_from = source;
                        })?;
                        return Ok(());
                    }
                    _ => self.displace(txn, source, id, path)?,
                }
            }
            let parent = Self::resolve_parent(txn.snapshot(), path)?;
            let fs_path = self.fs_path(path);
            fsutil::make_symlink(target, &fs_path)?;
            let now = fsutil::now_ms();
            let lm = last_modified.unwrap_or(now);
            fsutil::set_symlink_mtime(&fs_path, lm)?;
            txn.insert_file(RepoFile {
                id: RepoId::new(),
                parent: Some(parent),
                name: Self::name_of(path)?,
                last_local_revision: 0,
                last_modified: lm,
                created: now,
                last_sync_from: source,
                kind: RepoFileKind::Symlink {
                    target: target.to_string(),
                },
            })?;
            Ok(())
        })
    }

    /// Deletes an entity and its subtree.
    ///
    /// A collision anywhere in the subtree renames that subtree's root to
    /// a collision file instead: the delete is downgraded for that part
    /// and nothing below it is touched. Deleting an absent path is a
    /// no-op. Deleting the root path deletes each of its children in
    /// turn, leaving the root itself in place.
    pub fn delete(&self, source: Option<RepoId>, path: &RepoPath) -> CoreResult<()> {
        self.store.write_transaction(|txn| {
            let Some(id) = txn.snapshot().resolve(path) else {
                debug!(%path, "delete of absent path ignored");
                return Ok(());
            };
            if id == txn.snapshot().root_id() {
                let children: Vec<RepoId> =
                    txn.snapshot().children_of(id).map(|(_, c)| c).collect();
                for child in children {
                    self.delete_subtree(txn, source, child)?;
                }
                return Ok(());
            }
            self.delete_subtree(txn, source, id)
        })
    }

    fn delete_subtree(
        &self,
        txn: &mut WriteTxn<'_>,
        source: Option<RepoId>,
        id: RepoId,
    ) -> CoreResult<()> {
        if let Some(peer) = source {
            if collision::subtree_collides(txn.snapshot(), peer, id) {
                let preserved = resolve_by_rename(&self.root, &self.config, txn, id)?;
                info!(%preserved, "delete downgraded; local changes preserved");
                return Ok(());
            }
        }
        let path = txn.snapshot().path_of(id)?;
        let file = Self::row(txn.snapshot(), id)?;
        let fs_path = self.fs_path(&path);
        let removal = if file.is_directory() {
            fs::remove_dir_all(&fs_path)
        } else {
            fs::remove_file(&fs_path)
        };
        match removal {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        txn.remove_subtree(id)?;
        Self::record_delete(txn, source, &path, &file);
        Ok(())
    }

    /// Records a delete modification for every known peer except `skip`.
    pub(crate) fn record_delete(
        txn: &mut WriteTxn<'_>,
        skip: Option<RepoId>,
        path: &RepoPath,
        file: &RepoFile,
    ) {
        let (length, sha1) = match file.content() {
            Some((l, h)) => (Some(l), Some(h)),
            None => (None, None),
        };
        let remotes: Vec<RepoId> = txn.snapshot().remotes().map(|r| r.id).collect();
        for remote in remotes {
            if Some(remote) != skip {
                txn.record_modification(
                    remote,
                    ModificationData::Delete {
                        path: path.clone(),
                        length,
                        sha1,
                    },
                );
            }
        }
    }

    /// Copies an entity (recursively for directories) to a new path and
    /// records the copy for peers. A missing source is ignored: the
    /// corresponding file entries follow in the same change set.
    pub fn copy_entry(
        &self,
        source: Option<RepoId>,
        from_path: &RepoPath,
        to_path: &RepoPath,
    ) -> CoreResult<()> {
        self.store.write_transaction(|txn| {
            let Some(src_id) = txn.snapshot().resolve(from_path) else {
                debug!(%from_path, "copy source missing; ignored");
                return Ok(());
            };
            if let Some(peer) = source {
                collision::check_pending_delete(txn.snapshot(), peer, to_path)?;
            }
            if let Some(existing) = txn.snapshot().resolve(to_path) {
                if existing == src_id {
                    return Ok(());
                }
                self.displace(txn, source, existing, to_path)?;
            }
            let parent = Self::resolve_parent(txn.snapshot(), to_path)?;
            copy_fs_recursive(&self.fs_path(from_path), &self.fs_path(to_path))?;
            self.clone_rows(txn, src_id, parent, &Self::name_of(to_path)?, source)?;
            Self::record_copy(txn, source, from_path, to_path);
            Ok(())
        })
    }

    fn clone_rows(
        &self,
        txn: &mut WriteTxn<'_>,
        src_id: RepoId,
        new_parent: RepoId,
        new_name: &str,
        source: Option<RepoId>,
    ) -> CoreResult<()> {
        let mut stack = vec![(src_id, new_parent, new_name.to_string())];
        while let Some((sid, parent, name)) = stack.pop() {
            let src = Self::row(txn.snapshot(), sid)?;
            let kind = match src.kind {
                RepoFileKind::NormalFile {
                    length,
                    sha1,
                    chunks,
                    ..
                } => RepoFileKind::NormalFile {
                    length,
                    sha1,
                    chunks,
                    in_progress: false,
                },
                other => other,
            };
            let new_id = txn.insert_file(RepoFile {
                id: RepoId::new(),
                parent: Some(parent),
                name,
                last_local_revision: 0,
                last_modified: src.last_modified,
                created: fsutil::now_ms(),
                last_sync_from: source,
                kind,
            })?;
            let children: Vec<(String, RepoId)> = txn
                .snapshot()
                .children_of(sid)
                .map(|(n, c)| (n.to_string(), c))
                .collect();
            for (child_name, child_id) in children {
                stack.push((child_id, new_id, child_name));
            }
        }
        Ok(())
    }

    fn record_copy(
        txn: &mut WriteTxn<'_>,
        skip: Option<RepoId>,
        from_path: &RepoPath,
        to_path: &RepoPath,
    ) {
        let remotes: Vec<RepoId> = txn.snapshot().remotes().map(|r| r.id).collect();
        for remote in remotes {
            if Some(remote) != skip {
                txn.record_modification(
                    remote,
                    ModificationData::Copy {
                        from: from_path.clone(),
                        to: to_path.clone(),
                    },
                );
            }
        }
    }

    /// Moves an entity to a new path. Peers that have not seen the move
    /// receive it as a copy plus a delete of the old path.
    pub fn move_entry(
        &self,
        source: Option<RepoId>,
        from_path: &RepoPath,
        to_path: &RepoPath,
    ) -> CoreResult<()> {
        self.store.write_transaction(|txn| {
            let Some(src_id) = txn.snapshot().resolve(from_path) else {
                debug!(%from_path, "move source missing; ignored");
                return Ok(());
            };
            if let Some(peer) = source {
                collision::check_pending_delete(txn.snapshot(), peer, to_path)?;
            }
            if let Some(existing) = txn.snapshot().resolve(to_path) {
                if existing == src_id {
                    return Ok(());
                }
                self.displace(txn, source, existing, to_path)?;
            }
            let parent = Self::resolve_parent(txn.snapshot(), to_path)?;
            let file = Self::row(txn.snapshot(), src_id)?;
            fs::rename(self.fs_path(from_path), self.fs_path(to_path))?;
            txn.rename_file(src_id, parent, &Self::name_of(to_path)?)?;
            txn.update_file(src_id, |f| f.last_sync_from = source)?;
            Self::record_copy(txn, source, from_path, to_path);
            Self::record_delete(txn, source, from_path, &file);
            Ok(())
        })
    }

    /// Reads a byte range of a normal file.
    ///
    /// Returns `None` when the file is absent, not a normal file, or has
    /// an open transfer — the caller treats this as "changed or vanished
    /// concurrently" and retries the item on a later pass. A read past
    /// the end returns the available (possibly empty) tail.
    pub fn get_file_data(
        &self,
        path: &RepoPath,
        offset: u64,
        length: u32,
    ) -> CoreResult<Option<Vec<u8>>> {
        // Per-chunk hot path: id resolution goes through the bounded
        // cache, invalidated by the store on any tree mutation.
        let Some(id) = self.store.resolve_path(path) else {
            return Ok(None);
        };
        let servable = self.store.read(|s| {
            s.file(id)
                .map(|f| {
                    matches!(
                        f.kind,
                        RepoFileKind::NormalFile {
                            in_progress: false,
                            ..
                        }
                    )
                })
                .unwrap_or(false)
        });
        if !servable {
            return Ok(None);
        }
        let mut file = match File::open(self.fs_path(path)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }
}

fn copy_fs_recursive(src: &Path, dst: &Path) -> CoreResult<()> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        fsutil::make_symlink(&target.to_string_lossy(), dst)?;
    } else if file_type.is_dir() {
        match fs::create_dir(dst) {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => return Err(e.into()),
            _ => {}
        }
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_fs_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("root", &self.root)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
