//! Milestones: layout, validation, discovery and solidification.

pub mod layout;
pub mod nominee;
pub mod service;
pub mod solidifier;
pub mod tracker;

pub use layout::MilestoneBundleBuilder;
pub use nominee::{NomineeTracker, ValidatorSchedule};
pub use service::{MilestoneService, MilestoneValidity};
pub use solidifier::MilestoneSolidifier;
pub use tracker::MilestoneTracker;
