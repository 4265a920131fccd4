//! # repsync replica core
//!
//! The local side of a repository replica:
//!
//! - Metadata store with a monotonic revision clock, single-writer
//!   transactions and atomic snapshot persistence ([`store::MetaStore`])
//! - The entity tree model ([`model`])
//! - Worktree scan producing store rows and delete records
//! - Collision detection with preservation-by-rename resolution
//! - The chunked file-transfer state machine (begin → put → end)
//! - The change-set builder
//!
//! ## Key invariants
//!
//! - The revision clock is strictly increasing and never regresses after
//!   a crash; every row written in one transaction carries one revision.
//! - Exactly one tree root; `(parent, name)` unique among siblings.
//! - Collisions are resolved by renaming the local version aside, never
//!   by overwriting or deleting it.
//! - Files with an open transfer are excluded from outgoing change sets.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod collision;
mod config;
mod error;
pub mod fsutil;
pub mod model;
mod replica;
mod scan;
pub mod store;
mod transfer;

pub use collision::COLLISION_MARKER;
pub use config::{ReplicaConfig, META_DIR_NAME};
pub use error::{CoreError, CoreResult};
pub use replica::Replica;
pub use scan::ScanReport;
pub use transfer::BeginPutOutcome;
