//! The metadata store: tree rows, revision clock and transactions.
//!
//! The store keeps the whole metadata state of one replica in memory and
//! persists it as a single CBOR snapshot, written to a temp file and
//! atomically renamed on every commit. Writers are serialized: a write
//! transaction clones the state, mutates the clone and swaps it in on
//! commit, so a failed transaction leaves nothing behind and a crash
//! between commits leaves the previous snapshot intact — revisions never
//! regress.

mod lru;

pub use lru::LruCache;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    LastSyncToRemoteRepo, LocalRepository, ModificationRow, RemoteRepository, RepoFile,
    RepoFileKind,
};
use fs2::FileExt;
use parking_lot::Mutex;
use repsync_proto::{ModificationData, RepoId, RepoPath, Revision};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

const DB_FILE: &str = "meta.db";
const DB_TMP_FILE: &str = "meta.db.tmp";
const LOCK_FILE: &str = "lock";

/// The persisted state of one replica's metadata store.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreState {
    local: LocalRepository,
    root_id: RepoId,
    files: HashMap<RepoId, RepoFile>,
    modifications: Vec<ModificationRow>,
    remotes: HashMap<RepoId, RemoteRepository>,
    last_sync_to: HashMap<RepoId, LastSyncToRemoteRepo>,
    /// `(parent -> name -> child)` index; rebuilt on load, never persisted.
    #[serde(skip)]
    children: HashMap<RepoId, BTreeMap<String, RepoId>>,
}

impl StoreState {
    fn new(id: RepoId, public_key: Vec<u8>, created: i64) -> Self {
        let root = RepoFile {
            id: RepoId::new(),
            parent: None,
            name: String::new(),
            last_local_revision: 1,
            last_modified: created,
            created,
            last_sync_from: None,
            kind: RepoFileKind::Directory,
        };
        let root_id = root.id;
        let mut files = HashMap::new();
        files.insert(root_id, root);
        Self {
            local: LocalRepository {
                id,
                public_key,
                revision: 1,
            },
            root_id,
            files,
            modifications: Vec::new(),
            remotes: HashMap::new(),
            last_sync_to: HashMap::new(),
            // The root has no children yet; the index starts empty.
            children: HashMap::new(),
        }
    }

    /// The local repository singleton.
    #[must_use]
    pub fn local(&self) -> &LocalRepository {
        &self.local
    }

    /// Id of the tree root.
    #[must_use]
    pub fn root_id(&self) -> RepoId {
        self.root_id
    }

    /// Looks up a tree row by id.
    #[must_use]
    pub fn file(&self, id: RepoId) -> Option<&RepoFile> {
        self.files.get(&id)
    }

    /// All tree rows.
    pub fn files(&self) -> impl Iterator<Item = &RepoFile> {
        self.files.values()
    }

    /// Number of tree rows.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// The named child of a directory, if any.
    #[must_use]
    pub fn child(&self, parent: RepoId, name: &str) -> Option<RepoId> {
        self.children.get(&parent)?.get(name).copied()
    }

    /// Children of a directory, in name order.
    pub fn children_of(&self, parent: RepoId) -> impl Iterator<Item = (&str, RepoId)> {
        self.children
            .get(&parent)
            .into_iter()
            .flat_map(|m| m.iter().map(|(n, id)| (n.as_str(), *id)))
    }

    /// Resolves a path to a row id by walking from the root.
    #[must_use]
    pub fn resolve(&self, path: &RepoPath) -> Option<RepoId> {
        let mut id = self.root_id;
        for segment in path.segments() {
            id = self.child(id, segment)?;
        }
        Some(id)
    }

    /// Reconstructs the path of a row by walking to the root.
    pub fn path_of(&self, id: RepoId) -> CoreResult<RepoPath> {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            let file = self.files.get(&current).ok_or_else(|| {
                CoreError::structural(format!("unresolved row {current} in parent chain"))
            })?;
            match file.parent {
                None => break,
                Some(parent) => {
                    segments.push(file.name.clone());
                    current = parent;
                }
            }
        }
        segments.reverse();
        Ok(RepoPath::from_segments(segments)?)
    }

    /// Ids of a subtree in depth-first pre-order, root included.
    #[must_use]
    pub fn descendants(&self, root: RepoId) -> Vec<RepoId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            for (_, child) in self.children_of(id) {
                stack.push(child);
            }
        }
        out
    }

    /// Looks up a peer row.
    #[must_use]
    pub fn remote(&self, id: RepoId) -> Option<&RemoteRepository> {
        self.remotes.get(&id)
    }

    /// All peer rows.
    pub fn remotes(&self) -> impl Iterator<Item = &RemoteRepository> {
        self.remotes.values()
    }

    /// The outgoing watermarks for a peer (defaults before first sync).
    #[must_use]
    pub fn last_sync_to(&self, remote: RepoId) -> LastSyncToRemoteRepo {
        self.last_sync_to
            .get(&remote)
            .copied()
            .unwrap_or_default()
    }

    /// Modification rows scoped to a peer, in revision order.
    #[must_use]
    pub fn modifications_for(&self, remote: RepoId) -> Vec<&ModificationRow> {
        let mut rows: Vec<&ModificationRow> = self
            .modifications
            .iter()
            .filter(|m| m.remote == remote)
            .collect();
        rows.sort_by_key(|m| m.revision);
        rows
    }

    /// Rebuilds the children index, detecting duplicate sibling names.
    fn rebuild_children(&mut self) -> CoreResult<()> {
        let mut children: HashMap<RepoId, BTreeMap<String, RepoId>> = HashMap::new();
        for file in self.files.values() {
            if let Some(parent) = file.parent {
                let siblings = children.entry(parent).or_default();
                if siblings.insert(file.name.clone(), file.id).is_some() {
                    return Err(CoreError::structural(format!(
                        "duplicate sibling name `{}` under {parent}",
                        file.name
                    )));
                }
            }
        }
        self.children = children;
        Ok(())
    }

    /// Verifies the tree invariants: exactly one root, all rows reachable,
    /// parents are directories.
    pub fn verify_tree(&self) -> CoreResult<()> {
        let roots: Vec<_> = self.files.values().filter(|f| f.parent.is_none()).collect();
        if roots.len() != 1 {
            return Err(CoreError::structural(format!(
                "expected exactly one root, found {}",
                roots.len()
            )));
        }
        if roots[0].id != self.root_id {
            return Err(CoreError::structural("root row does not match root id"));
        }
        for file in self.files.values() {
            if let Some(parent) = file.parent {
                match self.files.get(&parent) {
                    None => {
                        return Err(CoreError::structural(format!(
                            "row {} references missing parent {parent}",
                            file.id
                        )))
                    }
                    Some(p) if !p.is_directory() => {
                        return Err(CoreError::structural(format!(
                            "row {} has non-directory parent {parent}",
                            file.id
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        let reachable = self.descendants(self.root_id).len();
        if reachable != self.files.len() {
            return Err(CoreError::structural(format!(
                "{} of {} rows unreachable from root",
                self.files.len() - reachable,
                self.files.len()
            )));
        }
        Ok(())
    }
}

/// A write transaction over the store.
///
/// Obtains the next revision from the clock; every row written through it
/// is stamped with that revision, and the `LocalRepository` revision is
/// advanced to it at commit — only if the transaction actually touched
/// revision-stamped rows. Watermark-only bookkeeping persists without
/// burning a revision.
pub struct WriteTxn<'a> {
    state: &'a mut StoreState,
    revision: Revision,
    tree_dirty: bool,
    meta_dirty: bool,
}

impl<'a> WriteTxn<'a> {
    /// The revision assigned to this transaction.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Read access to the (uncommitted) state.
    #[must_use]
    pub fn snapshot(&self) -> &StoreState {
        self.state
    }

    /// Inserts a new tree row, stamping it with the transaction revision.
    pub fn insert_file(&mut self, mut file: RepoFile) -> CoreResult<RepoId> {
        let parent = file.parent.ok_or_else(|| {
            CoreError::structural("inserted row must have a parent; the root already exists")
        })?;
        match self.state.files.get(&parent) {
            None => {
                return Err(CoreError::structural(format!(
                    "insert under missing parent {parent}"
                )))
            }
            Some(p) if !p.is_directory() => {
                return Err(CoreError::structural(format!(
                    "insert under non-directory {parent}"
                )))
            }
            Some(_) => {}
        }
        let siblings = self.state.children.entry(parent).or_default();
        if siblings.contains_key(&file.name) {
            return Err(CoreError::structural(format!(
                "duplicate sibling name `{}` under {parent}",
                file.name
            )));
        }
        file.last_local_revision = self.revision;
        siblings.insert(file.name.clone(), file.id);
        let id = file.id;
        self.state.files.insert(id, file);
        self.tree_dirty = true;
        Ok(id)
    }

    /// Mutates a row in place and stamps it.
    ///
    /// Must not change `parent` or `name`; use [`WriteTxn::rename_file`].
    pub fn update_file<F: FnOnce(&mut RepoFile)>(&mut self, id: RepoId, f: F) -> CoreResult<()> {
        let revision = self.revision;
        let file = self
            .state
            .files
            .get_mut(&id)
            .ok_or_else(|| CoreError::structural(format!("update of missing row {id}")))?;
        f(file);
        file.last_local_revision = revision;
        self.tree_dirty = true;
        Ok(())
    }

    /// Moves a row to a new parent and/or name, stamping it.
    pub fn rename_file(
        &mut self,
        id: RepoId,
        new_parent: RepoId,
        new_name: &str,
    ) -> CoreResult<()> {
        let (old_parent, old_name) = {
            let file = self
                .state
                .files
                .get(&id)
                .ok_or_else(|| CoreError::structural(format!("rename of missing row {id}")))?;
            let parent = file
                .parent
                .ok_or_else(|| CoreError::structural("the root cannot be renamed"))?;
            (parent, file.name.clone())
        };
        if let Some(existing) = self.state.child(new_parent, new_name) {
            if existing != id {
                return Err(CoreError::structural(format!(
                    "rename target `{new_name}` already exists under {new_parent}"
                )));
            }
        }
        if let Some(siblings) = self.state.children.get_mut(&old_parent) {
            siblings.remove(&old_name);
        }
        self.state
            .children
            .entry(new_parent)
            .or_default()
            .insert(new_name.to_string(), id);
        let revision = self.revision;
        if let Some(file) = self.state.files.get_mut(&id) {
            file.parent = Some(new_parent);
            file.name = new_name.to_string();
            file.last_local_revision = revision;
        }
        self.tree_dirty = true;
        Ok(())
    }

    /// Removes a whole subtree, returning the removed rows (root last).
    pub fn remove_subtree(&mut self, root: RepoId) -> CoreResult<Vec<RepoFile>> {
        if root == self.state.root_id {
            return Err(CoreError::structural("the tree root cannot be removed"));
        }
        let mut ids = self.state.descendants(root);
        // Children before parents.
        ids.reverse();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(file) = self.state.files.remove(&id) {
                if let Some(parent) = file.parent {
                    if let Some(siblings) = self.state.children.get_mut(&parent) {
                        siblings.remove(&file.name);
                    }
                }
                self.state.children.remove(&id);
                removed.push(file);
            }
        }
        self.tree_dirty = true;
        Ok(removed)
    }

    /// Appends a modification row for a destination peer.
    pub fn record_modification(&mut self, remote: RepoId, data: ModificationData) {
        self.state
            .modifications
            .push(ModificationRow::new(remote, self.revision, data));
        self.tree_dirty = true;
    }

    /// Deletes modification rows for a peer up to and including `up_to`.
    pub fn prune_modifications(&mut self, remote: RepoId, up_to: Revision) {
        let before = self.state.modifications.len();
        self.state
            .modifications
            .retain(|m| m.remote != remote || m.revision > up_to);
        if self.state.modifications.len() != before {
            self.meta_dirty = true;
        }
    }

    /// Inserts or replaces a peer row.
    pub fn upsert_remote(&mut self, remote: RemoteRepository) {
        self.state.remotes.insert(remote.id, remote);
        self.meta_dirty = true;
    }

    /// Mutates a peer row.
    pub fn update_remote<F: FnOnce(&mut RemoteRepository)>(
        &mut self,
        id: RepoId,
        f: F,
    ) -> CoreResult<()> {
        let remote = self
            .state
            .remotes
            .get_mut(&id)
            .ok_or_else(|| CoreError::structural(format!("unknown remote repository {id}")))?;
        f(remote);
        self.meta_dirty = true;
        Ok(())
    }

    /// Mutates (creating if absent) the watermark pair for a peer.
    pub fn update_last_sync_to<F: FnOnce(&mut LastSyncToRemoteRepo)>(
        &mut self,
        remote: RepoId,
        f: F,
    ) {
        let entry = self.state.last_sync_to.entry(remote).or_default();
        f(entry);
        debug_assert!(entry.is_consistent());
        self.meta_dirty = true;
    }
}

/// The metadata store of one replica.
///
/// Thread-safe; writers are serialized, readers see the last committed
/// snapshot.
pub struct MetaStore {
    state: Mutex<StoreState>,
    cache: Mutex<LruCache<RepoPath, RepoId>>,
    db_path: PathBuf,
    tmp_path: PathBuf,
    _lock: File,
}

impl MetaStore {
    /// Creates a fresh store in `meta_dir` for a new repository.
    pub fn create(
        meta_dir: &Path,
        id: RepoId,
        public_key: Vec<u8>,
        cache_capacity: usize,
    ) -> CoreResult<Self> {
        fs::create_dir_all(meta_dir)?;
        let lock = Self::acquire_lock(meta_dir)?;
        let db_path = meta_dir.join(DB_FILE);
        if db_path.exists() {
            return Err(CoreError::structural(format!(
                "store already exists at {}",
                db_path.display()
            )));
        }
        let state = StoreState::new(id, public_key, crate::fsutil::now_ms());
        let store = Self {
            state: Mutex::new(state),
            cache: Mutex::new(LruCache::new(cache_capacity)),
            tmp_path: meta_dir.join(DB_TMP_FILE),
            db_path,
            _lock: lock,
        };
        store.persist(&store.state.lock())?;
        Ok(store)
    }

    /// Opens an existing store in `meta_dir`.
    pub fn open(meta_dir: &Path, cache_capacity: usize) -> CoreResult<Self> {
        let lock = Self::acquire_lock(meta_dir)?;
        let db_path = meta_dir.join(DB_FILE);
        let file = File::open(&db_path)?;
        let mut state: StoreState =
            ciborium::from_reader(std::io::BufReader::new(file)).map_err(CoreError::codec)?;
        state.rebuild_children()?;
        state.verify_tree()?;
        Ok(Self {
            state: Mutex::new(state),
            cache: Mutex::new(LruCache::new(cache_capacity)),
            tmp_path: meta_dir.join(DB_TMP_FILE),
            db_path,
            _lock: lock,
        })
    }

    fn acquire_lock(meta_dir: &Path) -> CoreResult<File> {
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(meta_dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| CoreError::DatabaseLocked)?;
        Ok(lock)
    }

    fn persist(&self, state: &StoreState) -> CoreResult<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(state, &mut buf).map_err(CoreError::codec)?;
        let mut tmp = File::create(&self.tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        fs::rename(&self.tmp_path, &self.db_path)?;
        Ok(())
    }

    /// Runs a read closure against the committed state.
    pub fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Runs a write transaction.
    ///
    /// The closure mutates a clone of the state; on `Ok` the clone is
    /// persisted and swapped in (advancing the revision clock if any
    /// stamped rows were written), on `Err` nothing changes.
    pub fn write_transaction<T>(
        &self,
        f: impl FnOnce(&mut WriteTxn<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut guard = self.state.lock();
        let mut work = guard.clone();
        let revision = work.local.revision + 1;
        let mut txn = WriteTxn {
            state: &mut work,
            revision,
            tree_dirty: false,
            meta_dirty: false,
        };
        let value = f(&mut txn)?;
        let (tree_dirty, meta_dirty) = (txn.tree_dirty, txn.meta_dirty);
        if tree_dirty {
            work.local.revision = revision;
        }
        if tree_dirty || meta_dirty {
            self.persist(&work)?;
            *guard = work;
            if tree_dirty {
                self.cache.lock().clear();
            }
        }
        Ok(value)
    }

    /// Resolves a path to a row id through the bounded cache.
    #[must_use]
    pub fn resolve_path(&self, path: &RepoPath) -> Option<RepoId> {
        if let Some(id) = self.cache.lock().get(path) {
            return Some(id);
        }
        let id = self.state.lock().resolve(path)?;
        self.cache.lock().insert(path.clone(), id);
        Some(id)
    }
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MetaStore")
            .field("repository", &state.local.id)
            .field("revision", &state.local.revision)
            .field("files", &state.files.len())
            .finish_non_exhaustive()
    }
}
