//! The sync session orchestrator.
//!
//! One session drives a full exchange with a peer: a down-phase (pull
//! and apply the peer's change set), an up-phase (push the local change
//! set), and a second down-phase — collision files created on the peer
//! *during* the up-phase are pulled back immediately instead of waiting
//! for the next scheduled run.
//!
//! Watermarks are committed only after a change set has been durably and
//! completely applied, so a session interrupted at any point simply
//! replays an overlapping change set on retry; every apply step is
//! idempotent.

use crate::apply::{apply_change_set, ApplyStats};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::RepoTransport;
use parking_lot::RwLock;
use repsync_core::Replica;
use repsync_proto::{
    ModificationData, RepoFileKindDto, RepoPath, RepositoryDescriptor, REVISION_NONE,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The phase a session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No exchange running.
    Idle,
    /// Pulling the peer's change set.
    Down,
    /// Pushing the local change set.
    Up,
    /// Second down-pass for collision files created during the up-pass.
    FinalDown,
    /// Exchange completed.
    Done,
    /// Exchange failed.
    Failed,
}

impl SessionState {
    /// Returns true when a new exchange may start.
    #[must_use]
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Done | SessionState::Failed
        )
    }
}

/// Outcome of one completed exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    /// Items applied while pulling (both down-passes).
    pub pulled: ApplyStats,
    /// File entries pushed.
    pub pushed_files: u64,
    /// Modification records pushed.
    pub pushed_modifications: u64,
    /// Items skipped during the up-phase.
    pub push_skipped: u64,
    /// Wall-clock duration of the exchange.
    pub duration: Duration,
}

/// Cumulative statistics across exchanges, in the style of long-running
/// sync daemons.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed exchanges.
    pub sessions_completed: u64,
    /// Retries performed.
    pub retries: u64,
    /// Last error message, if any.
    pub last_error: Option<String>,
}

/// A sync session between the local replica and one peer.
pub struct SyncSession {
    local: Arc<Replica>,
    transport: Box<dyn RepoTransport>,
    config: SyncConfig,
    state: RwLock<SessionState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl SyncSession {
    /// Creates a session over an already-connected transport.
    pub fn new(local: Arc<Replica>, transport: Box<dyn RepoTransport>, config: SyncConfig) -> Self {
        Self {
            local,
            transport,
            config,
            state: RwLock::new(SessionState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// The current phase.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Cumulative statistics.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Requests cancellation; the session stops between items.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Runs one full exchange: down, up, down.
    pub fn run(&self) -> SyncResult<SyncReport> {
        if !self.state().can_start() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", self.state()),
                to: "Down".to_string(),
            });
        }
        self.cancelled.store(false, Ordering::SeqCst);
        let start = Instant::now();

        let result = self.run_phases();
        match result {
            Ok(mut report) => {
                report.duration = start.elapsed();
                self.set_state(SessionState::Done);
                let mut stats = self.stats.write();
                stats.sessions_completed += 1;
                stats.last_error = None;
                info!(?report, "sync session completed");
                Ok(report)
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                self.stats.write().last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Runs exchanges until one succeeds, backing off between attempts.
    pub fn run_with_retry(&self) -> SyncResult<SyncReport> {
        let retry = self.config.retry.clone();
        let mut last_error = None;
        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
                self.stats.write().retries += 1;
            }
            match self.run() {
                Ok(report) => return Ok(report),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    warn!(%e, attempt, "sync attempt failed; retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| SyncError::Protocol("no sync attempts made".into())))
    }

    fn run_phases(&self) -> SyncResult<SyncReport> {
        let peer = self.transport.get_repository_descriptor()?;
        self.local.request_connection(peer.id, &peer.public_key)?;
        self.local.accept_connection(peer.id)?;

        // Local edits must be stamped before anything incoming is
        // applied, or the collision gate cannot see them.
        if self.config.local_sync_first {
            self.local.scan()?;
        }

        let mut report = SyncReport::default();

        self.set_state(SessionState::Down);
        let down = self.down_phase(&peer)?;

        self.set_state(SessionState::Up);
        self.up_phase(&peer, &mut report)?;

        // Pull back whatever the up-phase displaced on the peer.
        self.set_state(SessionState::FinalDown);
        let final_down = self.down_phase(&peer)?;

        report.pulled = ApplyStats {
            modifications: down.modifications + final_down.modifications,
            files: down.files + final_down.files,
            skipped: down.skipped + final_down.skipped,
        };
        Ok(report)
    }

    fn down_phase(&self, peer: &RepositoryDescriptor) -> SyncResult<ApplyStats> {
        let since = self.local.remote_revision(peer.id);
        let set = self
            .transport
            .get_change_set(self.config.local_sync_first, since)?;
        if set.descriptor.id != peer.id {
            return Err(SyncError::Protocol(format!(
                "change set from {} but session peer is {}",
                set.descriptor.id, peer.id
            )));
        }
        debug!(
            modifications = set.modifications.len(),
            files = set.files.len(),
            since,
            "applying peer change set"
        );
        let stats = apply_change_set(
            &self.local,
            peer.id,
            &set,
            self.transport.as_ref(),
            &self.config.path_prefix,
            &self.cancelled,
        )?;
        // Watermarks move only on full success. With skipped items the
        // peer must keep re-sending the suffix until the tree settles,
        // or a later delete would destroy changes we never applied.
        if stats.skipped == 0 {
            self.transport.end_sync_from_repository()?;
            self.local
                .set_remote_revision(peer.id, set.descriptor.revision)?;
        } else {
            warn!(
                skipped = stats.skipped,
                "items skipped; down watermark not advanced"
            );
        }
        Ok(stats)
    }

    fn up_phase(&self, peer: &RepositoryDescriptor, report: &mut SyncReport) -> SyncResult<()> {
        let set = self.local.build_change_set(
            peer.id,
            REVISION_NONE,
            self.config.local_sync_first,
            &self.config.path_prefix,
        )?;
        debug!(
            modifications = set.modifications.len(),
            files = set.files.len(),
            "pushing local change set"
        );

        for modification in &set.modifications {
            self.check_cancelled()?;
            let result = match &modification.data {
                ModificationData::Delete { path, .. } => self.transport.delete(path),
                ModificationData::Copy { from, to } => self.transport.copy_entry(from, to),
            };
            match result {
                Ok(()) => report.pushed_modifications += 1,
                Err(e) if e.is_item_skip() => {
                    warn!(%e, "pushed modification skipped");
                    report.push_skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut wire_paths: HashMap<repsync_proto::RepoId, RepoPath> = HashMap::new();
        for entry in &set.files {
            self.check_cancelled()?;
            let wire_path = match entry.parent_id {
                None => RepoPath::root(),
                Some(parent) => wire_paths
                    .get(&parent)
                    .ok_or_else(|| {
                        SyncError::StructuralInvariant(format!(
                            "local change set entry {} has unresolved parent",
                            entry.id
                        ))
                    })?
                    .child(&entry.name)
                    .map_err(|e| SyncError::Protocol(e.to_string()))?,
            };
            wire_paths.insert(entry.id, wire_path.clone());

            let result = self.push_entry(entry, &wire_path);
            match result {
                Ok(true) => report.pushed_files += 1,
                Ok(false) => report.push_skipped += 1,
                Err(e) if e.is_item_skip() => {
                    warn!(%e, path = %wire_path, "pushed entry skipped");
                    report.push_skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.push_skipped == 0 {
            self.transport
                .end_sync_to_repository(set.descriptor.revision)?;
            self.local.complete_sync_to(peer.id)?;
        } else {
            warn!(
                skipped = report.push_skipped,
                "items skipped; up watermark not committed"
            );
        }
        Ok(())
    }

    fn push_entry(
        &self,
        entry: &repsync_proto::RepoFileDto,
        wire_path: &RepoPath,
    ) -> SyncResult<bool> {
        match &entry.kind {
            RepoFileKindDto::Directory => {
                let last_modified = if entry.needed_as_parent {
                    None
                } else {
                    Some(entry.last_modified)
                };
                self.transport.make_directory(wire_path, last_modified)?;
                Ok(true)
            }
            RepoFileKindDto::Symlink { target } => {
                self.transport
                    .make_symlink(wire_path, target, Some(entry.last_modified))?;
                Ok(true)
            }
            RepoFileKindDto::NormalFile {
                length,
                sha1,
                chunks,
            } => {
                let local_path = self.config.path_prefix.join(wire_path);
                self.transport.begin_put_file(wire_path)?;
                for chunk in chunks {
                    self.check_cancelled()?;
                    let data = self
                        .local
                        .get_file_data(&local_path, chunk.offset, chunk.length)?;
                    let Some(data) = data else {
                        debug!(path = %wire_path, "local file changed mid-push; skipping");
                        return Ok(false);
                    };
                    if data.len() != chunk.length as usize {
                        debug!(path = %wire_path, "local short read mid-push; skipping");
                        return Ok(false);
                    }
                    self.transport.put_file_data(wire_path, chunk.offset, &data)?;
                }
                self.transport
                    .end_put_file(wire_path, entry.last_modified, *length, Some(*sha1))?;
                Ok(true)
            }
        }
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Closes the underlying transport.
    pub fn close(&self) -> SyncResult<()> {
        self.transport.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_gating() {
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::Done.can_start());
        assert!(SessionState::Failed.can_start());
        assert!(!SessionState::Down.can_start());
        assert!(!SessionState::Up.can_start());
        assert!(!SessionState::FinalDown.can_start());
    }
}

// The full exchange scenarios live in `tests/integration.rs`, driving
// two on-disk replicas through a `LocalTransport`.
