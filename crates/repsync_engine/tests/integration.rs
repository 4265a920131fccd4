//! Full-exchange scenarios over two on-disk replicas wired through the
//! local-filesystem transport.

use repsync_core::{Replica, ReplicaConfig, META_DIR_NAME};
use repsync_engine::{LocalTransport, SessionState, SyncConfig, SyncSession};
use repsync_proto::RepoPath;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn replica(tmp: &tempfile::TempDir, name: &str) -> Arc<Replica> {
    Arc::new(Replica::init(tmp.path().join(name), ReplicaConfig::default()).unwrap())
}

/// A session from `local`, connected to `peer` over the local transport.
fn session(local: &Arc<Replica>, peer: &Arc<Replica>) -> SyncSession {
    let transport =
        LocalTransport::connect(Arc::clone(peer), local.descriptor(), RepoPath::root()).unwrap();
    SyncSession::new(Arc::clone(local), Box::new(transport), SyncConfig::new())
}

fn path(s: &str) -> RepoPath {
    RepoPath::parse(s).unwrap()
}

/// A comparable snapshot of a worktree: kind, content, symlink target
/// and file mtime per relative path.
#[derive(Debug, PartialEq, Eq)]
enum Entry {
    Dir,
    File(Vec<u8>, i64),
    Symlink(String),
}

fn snapshot(root: &Path) -> BTreeMap<String, Entry> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Entry>) {
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            if rel == META_DIR_NAME {
                continue;
            }
            let file_type = entry.file_type().unwrap();
            if file_type.is_symlink() {
                let target = fs::read_link(&path).unwrap().to_string_lossy().into_owned();
                out.insert(rel, Entry::Symlink(target));
            } else if file_type.is_dir() {
                out.insert(rel.clone(), Entry::Dir);
                walk(root, &path, out);
            } else {
                let meta = fs::metadata(&path).unwrap();
                let mtime = repsync_core::fsutil::system_time_ms(meta.modified().unwrap());
                out.insert(rel, Entry::File(fs::read(&path).unwrap(), mtime));
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

#[test]
fn initial_sync_replicates_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");

    fs::create_dir(a.root().join("1")).unwrap();
    fs::write(a.root().join("1/a"), b"content a").unwrap();
    fs::write(a.root().join("1/b"), b"content b").unwrap();

    let session = session(&a, &b);
    let report = session.run().unwrap();
    assert_eq!(session.state(), SessionState::Done);
    assert_eq!(report.pushed_files, 4); // root, /1, /1/a, /1/b
    assert_eq!(report.push_skipped, 0);

    assert_eq!(fs::read(b.root().join("1/a")).unwrap(), b"content a");
    assert_eq!(fs::read(b.root().join("1/b")).unwrap(), b"content b");

    // Hashes match on both sides.
    let hash = |r: &Arc<Replica>, p: &str| {
        r.store().read(|s| {
            let id = s.resolve(&path(p)).unwrap();
            s.file(id).unwrap().content().unwrap()
        })
    };
    assert_eq!(hash(&a, "/1/a"), hash(&b, "/1/a"));
    assert_eq!(hash(&a, "/1/b"), hash(&b, "/1/b"));

    // The peer recorded our revision as fully applied.
    let a_revision = a.store().read(|s| s.local().revision);
    assert_eq!(b.remote_revision(a.id()), a_revision);
    let b_revision = b.store().read(|s| s.local().revision);
    assert!(a.remote_revision(b.id()) <= b_revision);
    assert!(a.remote_revision(b.id()) > 0);
}

#[cfg(unix)]
#[test]
fn round_trip_converges_byte_for_byte() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");

    fs::create_dir_all(a.root().join("docs/deep")).unwrap();
    fs::write(a.root().join("docs/deep/x"), b"xxx").unwrap();
    fs::write(a.root().join("top"), b"t").unwrap();
    std::os::unix::fs::symlink("docs/deep/x", a.root().join("link")).unwrap();

    session(&a, &b).run().unwrap();
    assert_eq!(snapshot(a.root()), snapshot(b.root()));

    // Syncing back with no intervening changes alters nothing.
    let before = snapshot(a.root());
    session(&b, &a).run().unwrap();
    assert_eq!(snapshot(a.root()), before);
    assert_eq!(snapshot(b.root()), before);
}

#[test]
fn repeated_sessions_are_quiescent() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");

    fs::write(a.root().join("f"), b"data").unwrap();
    session(&a, &b).run().unwrap();

    let a_revision = a.store().read(|s| s.local().revision);
    let b_revision = b.store().read(|s| s.local().revision);

    let report = session(&a, &b).run().unwrap();
    assert_eq!(report.pushed_files, 0);
    assert_eq!(report.pulled.files, 0);

    // No revision churn: the exchange reached a fixed point.
    assert_eq!(a.store().read(|s| s.local().revision), a_revision);
    assert_eq!(b.store().read(|s| s.local().revision), b_revision);
}

#[test]
fn incremental_change_propagates() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");

    fs::write(a.root().join("f"), b"v1").unwrap();
    session(&a, &b).run().unwrap();

    fs::write(a.root().join("f"), b"v2-longer").unwrap();
    session(&a, &b).run().unwrap();

    assert_eq!(fs::read(b.root().join("f")).unwrap(), b"v2-longer");
}

#[test]
fn deletion_propagates_and_log_is_pruned() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");

    fs::create_dir(a.root().join("d")).unwrap();
    fs::write(a.root().join("d/f"), b"x").unwrap();
    session(&a, &b).run().unwrap();
    assert!(b.root().join("d/f").exists());

    fs::remove_dir_all(a.root().join("d")).unwrap();
    session(&a, &b).run().unwrap();

    assert!(!b.root().join("d").exists());
    assert!(b.store().read(|s| s.resolve(&path("/d")).is_none()));
    // Delivered modification rows are garbage-collected.
    a.store()
        .read(|s| assert!(s.modifications_for(b.id()).is_empty()));
}

#[test]
fn concurrent_edits_preserve_both_versions() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");

    fs::create_dir_all(a.root().join("2/1")).unwrap();
    fs::write(a.root().join("2/1/a"), b"base").unwrap();
    session(&a, &b).run().unwrap();

    // Independent edits on both sides.
    fs::write(a.root().join("2/1/a"), b"from-a").unwrap();
    fs::write(b.root().join("2/1/a"), b"from-b").unwrap();

    session(&a, &b).run().unwrap();

    for repo in [&a, &b] {
        let entries: Vec<String> = fs::read_dir(repo.root().join("2/1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        let collisions: Vec<&String> = entries
            .iter()
            .filter(|n| n.starts_with("a.collision-"))
            .collect();
        assert_eq!(collisions.len(), 1, "one collision file in {entries:?}");

        // Both versions survive: the peer's edit at the original path,
        // the local edit under the collision name.
        assert_eq!(
            fs::read(repo.root().join("2/1/a")).unwrap(),
            b"from-b",
            "incoming version at the original path"
        );
        assert_eq!(
            fs::read(repo.root().join("2/1").join(collisions[0])).unwrap(),
            b"from-a"
        );
    }
}

#[test]
fn delete_versus_modify_preserves_subtree_at_root() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");

    fs::create_dir_all(a.root().join("2/1")).unwrap();
    fs::write(a.root().join("2/1/a"), b"base").unwrap();
    session(&a, &b).run().unwrap();

    // A deletes the whole subtree while B modifies a file inside it.
    fs::remove_dir_all(a.root().join("2")).unwrap();
    fs::write(b.root().join("2/1/a"), b"modified on b").unwrap();

    session(&a, &b).run().unwrap();

    for repo in [&a, &b] {
        let entries: Vec<String> = fs::read_dir(repo.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != META_DIR_NAME)
            .collect();
        let collisions: Vec<&String> = entries
            .iter()
            .filter(|n| n.starts_with("2.collision-"))
            .collect();
        assert_eq!(
            collisions.len(),
            1,
            "collision dir at the root of {entries:?}"
        );
        // The preserved subtree sits at the root, not inside a
        // resurrected /2.
        assert!(!entries.iter().any(|n| n == "2"));
        assert_eq!(
            fs::read(repo.root().join(collisions[0]).join("1/a")).unwrap(),
            b"modified on b"
        );
    }
}

#[test]
fn interrupted_transfer_is_excluded_until_completed() {
    let tmp = tempfile::tempdir().unwrap();
    let b = replica(&tmp, "b");
    let c = replica(&tmp, "c");

    // A transfer into B left hanging between begin and end.
    let writer = repsync_proto::RepoId::new();
    b.begin_put_file(writer, &path("/half")).unwrap();
    b.put_file_data(&path("/half"), 0, b"partial").unwrap();

    // B syncs with C: the half-written file must not travel.
    session(&c, &b).run().unwrap();
    assert!(!c.root().join("half").exists());

    // Completing the transfer makes it travel on the next exchange.
    b.end_put_file(writer, &path("/half"), 1000, 7, None).unwrap();
    session(&c, &b).run().unwrap();
    assert_eq!(fs::read(c.root().join("half")).unwrap(), b"partial");
}

#[test]
fn revision_clock_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("a");
    let peer_id;
    let revision;
    {
        let a = Arc::new(Replica::init(&root, ReplicaConfig::default()).unwrap());
        let b = replica(&tmp, "b");
        peer_id = b.id();
        fs::write(a.root().join("f"), b"x").unwrap();
        session(&a, &b).run().unwrap();
        revision = a.store().read(|s| s.local().revision);
    }

    let reopened = Replica::open(&root, ReplicaConfig::default()).unwrap();
    assert_eq!(reopened.store().read(|s| s.local().revision), revision);
    assert!(reopened.remote_revision(peer_id) > 0);

    // The clock keeps increasing from where it was.
    fs::write(reopened.root().join("g"), b"y").unwrap();
    reopened.scan().unwrap();
    assert!(reopened.store().read(|s| s.local().revision) > revision);
}

#[test]
fn prefix_scoped_connection_sees_only_subtree() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");

    fs::create_dir_all(a.root().join("pub/sub")).unwrap();
    fs::write(a.root().join("pub/sub/f"), b"shared").unwrap();
    fs::write(a.root().join("private"), b"secret").unwrap();
    a.scan().unwrap();

    // B mounts only A's /pub.
    let transport = LocalTransport::connect(
        Arc::clone(&a),
        b.descriptor(),
        path("/pub"),
    )
    .unwrap();
    let session = SyncSession::new(Arc::clone(&b), Box::new(transport), SyncConfig::new());
    session.run().unwrap();

    assert_eq!(fs::read(b.root().join("sub/f")).unwrap(), b"shared");
    assert!(!b.root().join("private").exists());
    assert!(!b.root().join("pub").exists());

    // B's local files land inside A's /pub on the way back.
    fs::write(b.root().join("from-b"), b"up").unwrap();
    session.run().unwrap();
    assert_eq!(fs::read(a.root().join("pub/from-b")).unwrap(), b"up");
}

#[test]
fn three_replicas_converge_pairwise() {
    let tmp = tempfile::tempdir().unwrap();
    let a = replica(&tmp, "a");
    let b = replica(&tmp, "b");
    let c = replica(&tmp, "c");

    fs::write(a.root().join("from-a"), b"1").unwrap();
    fs::write(c.root().join("from-c"), b"3").unwrap();

    session(&a, &b).run().unwrap();
    session(&b, &c).run().unwrap();
    session(&a, &b).run().unwrap();

    for repo in [&a, &b, &c] {
        assert_eq!(fs::read(repo.root().join("from-a")).unwrap(), b"1");
        assert_eq!(fs::read(repo.root().join("from-c")).unwrap(), b"3");
    }
}
