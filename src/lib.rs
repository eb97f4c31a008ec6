//! WolfBlock - Synchronously Replicated Block Storage
//!
//! A Rust block storage engine that keeps several replicas of a volume in
//! lockstep. Every write is fanned out to all healthy replicas and only
//! acknowledged once a write quorum has applied it.
//!
//! # Architecture
//!
//! A controller owns the volume and talks to replica agents over a framed
//! TCP protocol. Each replica stores the volume as a copy-on-write chain of
//! layer files (snapshots up to a writable head) tracked by an embedded
//! SQLite catalog, and carries a monotonic revision counter that advances
//! with every applied write.
//!
//! # Features
//!
//! - Synchronous write fan-out with quorum acknowledgement
//! - Round-robin reads with failover
//! - Snapshots, revert, checkpoint, resize and snapshot removal
//! - Online rebuild of lagging replicas while writes continue
//! - Differential block transfer by SHA-256 digests, LZ4 on the wire
//! - Backup export of snapshots into flat images
//! - HTTP API for volume management

pub mod api;
pub mod backup;
pub mod chain;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod network;
pub mod replica;
pub mod revision;
pub mod state;
pub mod sync;

pub use config::WolfBlockConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::chain::{ChainOptions, ChainStore, LayerInfo, HEAD_NAME};
    pub use crate::config::WolfBlockConfig;
    pub use crate::controller::{Controller, ControllerOptions, ReplicaBackend, ReplicaConnector};
    pub use crate::error::{Error, Result};
    pub use crate::replica::Replica;
    pub use crate::state::{ReplicaMode, ReplicaState};
    pub use crate::sync::{SyncAgent, SyncReport};
}
