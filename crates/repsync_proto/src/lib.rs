//! # repsync protocol types
//!
//! Shared types exchanged between repository replicas:
//!
//! - Identifiers and content hashes ([`RepoId`], [`Sha1Hash`])
//! - Canonical repository paths ([`RepoPath`])
//! - File and modification records ([`RepoFileDto`], [`ModificationDto`])
//! - Repository descriptors and change sets ([`RepositoryDescriptor`],
//!   [`ChangeSet`])
//!
//! All paths on the wire are peer-relative and forward-slash separated,
//! regardless of the host OS. A change set is self-contained: every file
//! entry's ancestor chain up to the (possibly virtual) root is present in
//! the same set, so the receiver can always resolve full paths.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_set;
mod descriptor;
mod error;
mod file;
mod modification;
mod path;
mod types;

pub use change_set::ChangeSet;
pub use descriptor::RepositoryDescriptor;
pub use error::{ProtoError, ProtoResult};
pub use file::{FileChunkDto, RepoFileDto, RepoFileKindDto};
pub use modification::{ModificationData, ModificationDto};
pub use path::RepoPath;
pub use types::{RepoId, Revision, Sha1Hash, Sha1Hasher, TimestampMs, REVISION_NONE};
