//! Ledger snapshots.
//!
//! - [`provider`]: the `initial` and `latest` snapshots and their loading
//! - [`service`]: replay, rollback and generation of new snapshots
//! - [`local`]: periodic local snapshots
//! - [`files`]: the on-disk text format

pub mod files;
pub mod local;
pub mod provider;
pub mod service;

pub use local::LocalSnapshotManager;
pub use provider::SnapshotProvider;
pub use service::SnapshotService;
