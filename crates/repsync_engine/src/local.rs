//! Local-filesystem transport.
//!
//! Connects directly to a peer replica living on the same host: every
//! transport operation delegates to the peer's `Replica`, applying the
//! connecting repository's id as the operation source. Trust is implicit
//! for the local medium.

use crate::error::SyncResult;
use crate::registry::TransportRegistry;
use crate::transport::RepoTransport;
use repsync_core::{Replica, ReplicaConfig};
use repsync_proto::{
    ChangeSet, RepoId, RepoPath, RepositoryDescriptor, Revision, Sha1Hash, TimestampMs,
};
use std::sync::Arc;

/// Transport to a replica reachable through the local filesystem.
pub struct LocalTransport {
    peer: Arc<Replica>,
    client: RepositoryDescriptor,
    prefix: RepoPath,
}

impl LocalTransport {
    /// URL scheme served by this transport.
    pub const SCHEME: &'static str = "file";

    /// Connects to a peer replica, registering the client with it.
    pub fn connect(
        peer: Arc<Replica>,
        client: RepositoryDescriptor,
        prefix: RepoPath,
    ) -> SyncResult<Self> {
        peer.request_connection(client.id, &client.public_key)?;
        // The local medium is implicitly trusted.
        peer.accept_connection(client.id)?;
        Ok(Self {
            peer,
            client,
            prefix,
        })
    }

    /// Registers the `file://` factory in a transport registry.
    pub fn register(registry: &mut TransportRegistry) {
        registry.register(
            Self::SCHEME,
            0,
            Box::new(|params| {
                let path = params
                    .url
                    .strip_prefix("file://")
                    .unwrap_or(params.url.as_str());
                let peer = Replica::open(path, ReplicaConfig::default())?;
                let transport = LocalTransport::connect(
                    Arc::new(peer),
                    params.client.clone(),
                    params.path_prefix.clone(),
                )?;
                Ok(Box::new(transport))
            }),
        );
    }

    fn scoped(&self, path: &RepoPath) -> RepoPath {
        self.prefix.join(path)
    }
}

impl RepoTransport for LocalTransport {
    fn get_repository_descriptor(&self) -> SyncResult<RepositoryDescriptor> {
        Ok(self.peer.descriptor())
    }

    fn request_connection(&self, id: RepoId, public_key: &[u8]) -> SyncResult<()> {
        self.peer.request_connection(id, public_key)?;
        Ok(())
    }

    fn get_change_set(
        &self,
        local_sync_first: bool,
        since_revision: Revision,
    ) -> SyncResult<ChangeSet> {
        Ok(self.peer.build_change_set(
            self.client.id,
            since_revision,
            local_sync_first,
            &self.prefix,
        )?)
    }

    fn make_directory(
        &self,
        path: &RepoPath,
        last_modified: Option<TimestampMs>,
    ) -> SyncResult<()> {
        self.peer
            .make_directory(Some(self.client.id), &self.scoped(path), last_modified)?;
        Ok(())
    }

    fn make_symlink(
        &self,
        path: &RepoPath,
        target: &str,
        last_modified: Option<TimestampMs>,
    ) -> SyncResult<()> {
        self.peer
            .make_symlink(Some(self.client.id), &self.scoped(path), target, last_modified)?;
        Ok(())
    }

    fn copy_entry(&self, from: &RepoPath, to: &RepoPath) -> SyncResult<()> {
        self.peer
            .copy_entry(Some(self.client.id), &self.scoped(from), &self.scoped(to))?;
        Ok(())
    }

    fn move_entry(&self, from: &RepoPath, to: &RepoPath) -> SyncResult<()> {
        self.peer
            .move_entry(Some(self.client.id), &self.scoped(from), &self.scoped(to))?;
        Ok(())
    }

    fn delete(&self, path: &RepoPath) -> SyncResult<()> {
        self.peer.delete(Some(self.client.id), &self.scoped(path))?;
        Ok(())
    }

    fn get_file_data(
        &self,
        path: &RepoPath,
        offset: u64,
        length: u32,
    ) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.peer.get_file_data(&self.scoped(path), offset, length)?)
    }

    fn begin_put_file(&self, path: &RepoPath) -> SyncResult<()> {
        self.peer.begin_put_file(self.client.id, &self.scoped(path))?;
        Ok(())
    }

    fn put_file_data(&self, path: &RepoPath, offset: u64, data: &[u8]) -> SyncResult<()> {
        self.peer.put_file_data(&self.scoped(path), offset, data)?;
        Ok(())
    }

    fn end_put_file(
        &self,
        path: &RepoPath,
        last_modified: TimestampMs,
        length: u64,
        sha1: Option<Sha1Hash>,
    ) -> SyncResult<()> {
        self.peer
            .end_put_file(self.client.id, &self.scoped(path), last_modified, length, sha1)?;
        Ok(())
    }

    fn end_sync_from_repository(&self) -> SyncResult<()> {
        self.peer.complete_sync_to(self.client.id)?;
        Ok(())
    }

    fn end_sync_to_repository(&self, from_local_revision: Revision) -> SyncResult<()> {
        self.peer
            .set_remote_revision(self.client.id, from_local_revision)?;
        Ok(())
    }

    fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}
