//! The transport contract between replicas.

use crate::error::SyncResult;
use repsync_proto::{ChangeSet, RepoId, RepoPath, RepositoryDescriptor, Revision, Sha1Hash, TimestampMs};

/// A connection to a peer repository, implemented once per communication
/// medium (local filesystem, network).
///
/// The orchestrator and protocol logic are transport-agnostic: they see
/// only this contract. All paths are peer-relative and forward-slash
/// separated; a transport scoped to a subtree prefixes and un-prefixes
/// them transparently. Every operation is designed idempotent so a
/// retried session may safely replay an overlapping change set.
pub trait RepoTransport: Send + Sync {
    /// Returns the peer's descriptor. Served anonymously.
    fn get_repository_descriptor(&self) -> SyncResult<RepositoryDescriptor>;

    /// Registers a pending trust request on the peer.
    fn request_connection(&self, id: RepoId, public_key: &[u8]) -> SyncResult<()>;

    /// Fetches the peer's change set after `since_revision`
    /// (`REVISION_NONE` lets the peer use its stored watermark).
    fn get_change_set(&self, local_sync_first: bool, since_revision: Revision)
        -> SyncResult<ChangeSet>;

    /// Creates a directory, optionally stamping its timestamp.
    fn make_directory(&self, path: &RepoPath, last_modified: Option<TimestampMs>)
        -> SyncResult<()>;

    /// Creates or retargets a symlink.
    fn make_symlink(
        &self,
        path: &RepoPath,
        target: &str,
        last_modified: Option<TimestampMs>,
    ) -> SyncResult<()>;

    /// Copies an entity.
    fn copy_entry(&self, from: &RepoPath, to: &RepoPath) -> SyncResult<()>;

    /// Moves an entity.
    fn move_entry(&self, from: &RepoPath, to: &RepoPath) -> SyncResult<()>;

    /// Deletes an entity and its subtree.
    fn delete(&self, path: &RepoPath) -> SyncResult<()>;

    /// Reads a byte range of a file. `None` (or a short read) signals
    /// the file changed or vanished concurrently.
    fn get_file_data(
        &self,
        path: &RepoPath,
        offset: u64,
        length: u32,
    ) -> SyncResult<Option<Vec<u8>>>;

    /// Opens a file transfer.
    fn begin_put_file(&self, path: &RepoPath) -> SyncResult<()>;

    /// Writes a byte range into an open transfer.
    fn put_file_data(&self, path: &RepoPath, offset: u64, data: &[u8]) -> SyncResult<()>;

    /// Completes a file transfer.
    fn end_put_file(
        &self,
        path: &RepoPath,
        last_modified: TimestampMs,
        length: u64,
        sha1: Option<Sha1Hash>,
    ) -> SyncResult<()>;

    /// Tells the peer that its change set was fully applied; the peer
    /// commits its synced watermark and prunes delivered modification
    /// rows. Idempotent.
    fn end_sync_from_repository(&self) -> SyncResult<()>;

    /// Tells the peer that our state up to `from_local_revision` was
    /// fully pushed; the peer records it as the watermark for future
    /// exchanges from this side.
    fn end_sync_to_repository(&self, from_local_revision: Revision) -> SyncResult<()>;

    /// Closes the connection.
    fn close(&self) -> SyncResult<()>;
}
