//! Filesystem helpers: timestamps, symlinks and content hashing.

use crate::error::CoreResult;
use crate::model::FileChunk;
use filetime::FileTime;
use repsync_proto::{Sha1Hash, Sha1Hasher, TimestampMs};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the epoch.
#[must_use]
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMs)
        .unwrap_or(0)
}

/// Converts a filesystem timestamp to milliseconds since the epoch.
#[must_use]
pub fn system_time_ms(time: SystemTime) -> TimestampMs {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as TimestampMs,
        // Pre-epoch timestamps count backwards.
        Err(e) => -(e.duration().as_millis() as TimestampMs),
    }
}

fn to_file_time(ms: TimestampMs) -> FileTime {
    let secs = ms.div_euclid(1000);
    let nanos = (ms.rem_euclid(1000) * 1_000_000) as u32;
    FileTime::from_unix_time(secs, nanos)
}

/// Stamps a file's or directory's modification time.
pub fn set_mtime(path: &Path, ms: TimestampMs) -> CoreResult<()> {
    filetime::set_file_mtime(path, to_file_time(ms))?;
    Ok(())
}

/// Stamps a symlink's own modification time (not its target's).
pub fn set_symlink_mtime(path: &Path, ms: TimestampMs) -> CoreResult<()> {
    let ft = to_file_time(ms);
    filetime::set_symlink_file_times(path, ft, ft)?;
    Ok(())
}

/// Creates a symlink at `path` pointing at `target`.
#[cfg(unix)]
pub fn make_symlink(target: &str, path: &Path) -> CoreResult<()> {
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

/// Creates a symlink at `path` pointing at `target`.
#[cfg(not(unix))]
pub fn make_symlink(_target: &str, _path: &Path) -> CoreResult<()> {
    Err(crate::error::CoreError::SymlinkUnsupported)
}

/// Reads into `buf` until it is full or EOF is reached.
fn read_full(file: &mut File, buf: &mut [u8]) -> CoreResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Hashes a file's content, producing its length, whole-content SHA-1 and
/// chunk table at the given chunk size.
pub fn hash_file(path: &Path, chunk_size: u32) -> CoreResult<(u64, Sha1Hash, Vec<FileChunk>)> {
    let mut file = File::open(path)?;
    let mut whole = Sha1Hasher::new();
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; chunk_size as usize];
    let mut offset = 0u64;
    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        whole.update(&buf[..n]);
        chunks.push(FileChunk {
            offset,
            length: n as u32,
            sha1: Sha1Hash::digest(&buf[..n]),
        });
        offset += n as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok((offset, whole.finish(), chunks))
}
