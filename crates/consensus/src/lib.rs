//! Consensus core of the Tangle node.
//!
//! The pieces, bottom-up:
//!
//! - [`BundleValidator`] and [`TransactionValidator`]: structural checks and
//!   solidity, with the [`SolidityPropagator`] cascading solidity upward
//! - [`milestone`]: milestone layout and validation, the
//!   [`MilestoneTracker`] that discovers them, the [`NomineeTracker`]
//!   rotating validator sets and the [`MilestoneSolidifier`]
//! - [`LatestSolidMilestoneTracker`] and [`LedgerService`]: sequential
//!   application of solid rounds, with repair on failure
//! - [`snapshot`]: the initial and latest snapshots, replay, rollback and
//!   local snapshots
//!
//! Every background task implements [`Worker`]; running them on threads is
//! left to the node.

mod bundle_validator;
mod clock;
mod collaborators;
mod config;
mod error;
mod events;
mod latest_solid;
mod ledger;
pub mod milestone;
mod seen_rounds;
pub mod snapshot;
mod solidity;
mod transaction_validator;
mod worker;

pub use bundle_validator::{is_inconsistent, BundleValidator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{NoopRequestQueue, RequestQueue, TipSelector};
pub use config::ConsensusConfig;
pub use error::{BundleError, ConsensusError, LedgerError, SnapshotError, ValidationError};
pub use events::{ConsensusEvent, EventBus};
pub use latest_solid::{LatestSolidMilestoneTracker, RepairState, RoundLedger};
pub use ledger::LedgerService;
pub use milestone::{
    MilestoneBundleBuilder, MilestoneService, MilestoneSolidifier, MilestoneTracker,
    MilestoneValidity, NomineeTracker, ValidatorSchedule,
};
pub use seen_rounds::SeenRoundsRetriever;
pub use snapshot::{LocalSnapshotManager, SnapshotProvider, SnapshotService};
pub use solidity::{SolidQueue, SolidityPropagator};
pub use transaction_validator::{TransactionValidator, MAX_TIMESTAMP_FUTURE_SECS};
pub use worker::{StopFlag, Worker};
