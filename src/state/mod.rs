//! State Management Module
//!
//! Handles the persistent replica catalog and the replica membership
//! model shared by replicas and the controller.

mod tracker;
mod membership;

pub use tracker::{CatalogUpdate, DiskRecord, StateTracker, DB_FILE};
pub use membership::{ReplicaMode, ReplicaState, VolumeSummary};
