//! # repsync sync engine
//!
//! Drives a full exchange between two repository replicas:
//!
//! - The transport contract ([`RepoTransport`]) and its explicit,
//!   scheme-keyed registry ([`TransportRegistry`])
//! - The local-filesystem transport ([`LocalTransport`])
//! - Change-set application ([`apply_change_set`])
//! - The session orchestrator ([`SyncSession`]): down → up → down, with
//!   retry, statistics and cancellation
//!
//! ## Key invariants
//!
//! - Watermarks are committed only after a change set is fully applied:
//!   delivery is at-least-once, and every apply step is idempotent.
//! - A pending-delete race fails only the affected item, never the
//!   session; the item is retried on a later pass.
//! - Structural invariant violations abort the session before any
//!   watermark commit.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod config;
mod error;
mod local;
mod registry;
mod session;
mod transport;

pub use apply::{apply_change_set, ApplyStats};
pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use local::LocalTransport;
pub use registry::{TransportFactory, TransportParams, TransportRegistry};
pub use session::{SessionState, SyncReport, SyncSession, SyncStats};
pub use transport::RepoTransport;
