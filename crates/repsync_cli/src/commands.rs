//! Command implementations.

use repsync_core::{Replica, ReplicaConfig};
use repsync_engine::{
    LocalTransport, RetryConfig, SyncConfig, SyncSession, TransportParams, TransportRegistry,
};
use repsync_proto::RepoPath;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

type CliResult = Result<(), Box<dyn Error>>;

/// Initializes a repository in `root`.
pub fn init(root: &Path) -> CliResult {
    let replica = Replica::init(root, ReplicaConfig::default())?;
    println!("initialized repository {} at {}", replica.id(), root.display());
    Ok(())
}

/// Scans the worktree of the repository at `root`.
pub fn scan(root: &Path) -> CliResult {
    let replica = Replica::open(root, ReplicaConfig::default())?;
    let report = replica.scan()?;
    println!(
        "scan complete: {} added, {} updated, {} removed",
        report.added, report.updated, report.removed
    );
    Ok(())
}

/// Prints repository state and peer watermarks.
pub fn status(root: &Path) -> CliResult {
    let replica = Replica::open(root, ReplicaConfig::default())?;
    replica.store().read(|s| {
        println!("repository: {}", s.local().id);
        println!("revision:   {}", s.local().revision);
        println!("entities:   {}", s.file_count());

        let remotes: Vec<_> = s.remotes().collect();
        if remotes.is_empty() {
            println!("peers:      none");
        } else {
            println!("peers:");
            for remote in remotes {
                let watermarks = s.last_sync_to(remote.id);
                println!(
                    "  {}  applied-from={}  synced-to={}{}",
                    remote.id,
                    remote.local_revision,
                    watermarks.revision_synced,
                    if remote.pending { "  (pending)" } else { "" }
                );
            }
        }
    });
    Ok(())
}

/// Runs a sync session against a peer URL.
pub fn sync(
    root: &Path,
    url: &str,
    remote_prefix: Option<&str>,
    local_prefix: Option<&str>,
    no_local_sync: bool,
    retries: u32,
) -> CliResult {
    let local = Arc::new(Replica::open(root, ReplicaConfig::default())?);

    let mut registry = TransportRegistry::new();
    LocalTransport::register(&mut registry);

    let mut params = TransportParams::new(url, local.descriptor());
    if let Some(prefix) = remote_prefix {
        params = params.with_path_prefix(RepoPath::parse(prefix)?);
    }
    let transport = registry.open(&params)?;

    let mut config = SyncConfig::new().with_retry(RetryConfig::new(retries.max(1)));
    if let Some(prefix) = local_prefix {
        config = config.with_path_prefix(RepoPath::parse(prefix)?);
    }
    if no_local_sync {
        config = config.without_local_sync();
    }

    let session = SyncSession::new(local, transport, config);
    let report = session.run_with_retry()?;
    session.close()?;

    println!(
        "sync complete in {:.1?}: pulled {} files / {} modifications, pushed {} files / {} modifications, {} skipped",
        report.duration,
        report.pulled.files,
        report.pulled.modifications,
        report.pushed_files,
        report.pushed_modifications,
        report.pulled.skipped + report.push_skipped
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_status_and_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");

        init(&root).unwrap();
        std::fs::write(root.join("f"), b"x").unwrap();
        scan(&root).unwrap();
        status(&root).unwrap();
    }

    #[test]
    fn sync_between_two_local_repositories() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        init(&a).unwrap();
        init(&b).unwrap();
        std::fs::write(a.join("f"), b"payload").unwrap();

        sync(&a, &format!("file://{}", b.display()), None, None, false, 1).unwrap();

        assert_eq!(std::fs::read(b.join("f")).unwrap(), b"payload");
    }
}
