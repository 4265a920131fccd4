//! Canonical repository paths.

use crate::error::{ProtoError, ProtoResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A canonical, peer-relative repository path.
///
/// Paths are forward-slash separated regardless of the host OS. The root of
/// a repository (or of a prefix-scoped subtree) is the empty path. Segments
/// never contain `/`, are never empty and never `.` or `..`, so a
/// `RepoPath` can always be resolved safely below a worktree directory.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RepoPath {
    segments: Vec<String>,
}

impl RepoPath {
    /// Returns the root path (no segments).
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a path from its forward-slash string form.
    ///
    /// Leading, trailing and repeated slashes are tolerated and collapsed;
    /// `.` and `..` segments are rejected.
    pub fn parse(s: &str) -> ProtoResult<Self> {
        let mut segments = Vec::new();
        for segment in s.split('/') {
            if segment.is_empty() {
                continue;
            }
            if segment == "." || segment == ".." {
                return Err(ProtoError::InvalidPath {
                    path: s.to_string(),
                    reason: format!("illegal segment `{segment}`"),
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Builds a path from already-validated segments.
    ///
    /// Returns an error if any segment is empty or contains a slash.
    pub fn from_segments<I, S>(iter: I) -> ProtoResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut segments = Vec::new();
        for segment in iter {
            let segment = segment.into();
            if segment.is_empty() || segment.contains('/') || segment == "." || segment == ".." {
                return Err(ProtoError::InvalidPath {
                    path: segment.clone(),
                    reason: "illegal segment".to_string(),
                });
            }
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    /// Returns true for the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// The final segment, `None` for the root.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The parent path, `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// The path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Appends a single segment.
    pub fn child(&self, name: &str) -> ProtoResult<Self> {
        let mut segments = self.segments.clone();
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(ProtoError::InvalidPath {
                path: name.to_string(),
                reason: "illegal segment".to_string(),
            });
        }
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// Joins another path below this one.
    #[must_use]
    pub fn join(&self, other: &RepoPath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Returns true if `self` equals `prefix` or lies below it.
    #[must_use]
    pub fn starts_with(&self, prefix: &RepoPath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Strips `prefix`, returning the remainder relative to it.
    ///
    /// Returns `None` if `self` does not lie at or below `prefix`.
    #[must_use]
    pub fn strip_prefix(&self, prefix: &RepoPath) -> Option<Self> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Self {
            segments: self.segments[prefix.segments.len()..].to_vec(),
        })
    }

    /// Resolves this path below a filesystem base directory.
    #[must_use]
    pub fn to_fs_path(&self, base: &Path) -> PathBuf {
        let mut out = base.to_path_buf();
        for segment in &self.segments {
            out.push(segment);
        }
        out
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoPath({self})")
    }
}

impl FromStr for RepoPath {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RepoPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RepoPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}
