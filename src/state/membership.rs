//! Replica Membership
//!
//! Replica participation modes and the controller's view of each replica.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Replica participation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaMode {
    /// Receives writes but serves no reads (rebuild target)
    WriteOnly,
    /// Fully in quorum
    ReadWrite,
    /// Rejects all I/O until rebuilt or removed
    Errored,
}

impl ReplicaMode {
    /// Stable string form used in the catalog and on the API
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaMode::WriteOnly => "WO",
            ReplicaMode::ReadWrite => "RW",
            ReplicaMode::Errored => "ERR",
        }
    }

    /// Check whether the state machine allows moving to `next`.
    ///
    /// Leaving ReadWrite for WriteOnly would roll the counter back without a
    /// rebuild, so it has to go through Errored.
    pub fn can_transition_to(&self, next: ReplicaMode) -> bool {
        use ReplicaMode::*;
        matches!(
            (self, next),
            (WriteOnly, WriteOnly)
                | (ReadWrite, ReadWrite)
                | (Errored, Errored)
                | (Errored, WriteOnly)
                | (WriteOnly, ReadWrite)
                | (ReadWrite, Errored)
                | (WriteOnly, Errored)
        )
    }

    /// Validate a transition, returning `InvalidState` when forbidden
    pub fn transition(&self, next: ReplicaMode) -> Result<ReplicaMode> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidState(format!(
                "Replica mode cannot change from {} to {}",
                self, next
            )))
        }
    }

    /// Mode may serve client reads
    pub fn can_read(&self) -> bool {
        *self == ReplicaMode::ReadWrite
    }

    /// Mode may apply writes
    pub fn can_write(&self) -> bool {
        matches!(self, ReplicaMode::ReadWrite | ReplicaMode::WriteOnly)
    }
}

impl std::fmt::Display for ReplicaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReplicaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "WO" | "WRITEONLY" => Ok(ReplicaMode::WriteOnly),
            "RW" | "READWRITE" => Ok(ReplicaMode::ReadWrite),
            "ERR" | "ERRORED" => Ok(ReplicaMode::Errored),
            other => Err(Error::InvalidState(format!("Unknown replica mode '{}'", other))),
        }
    }
}

/// Controller view of a single replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Replica address (host:port, or a local name for in-process replicas)
    pub address: String,
    /// Current mode as seen by the controller
    pub mode: ReplicaMode,
    /// Last known revision counter
    pub revision: u64,
    /// Target of a running rebuild
    pub rebuilding: bool,
    /// Requests currently in flight
    pub in_flight: usize,
    /// When the replica was attached
    pub added_at: chrono::DateTime<chrono::Utc>,
}

impl ReplicaState {
    pub fn new(address: String, mode: ReplicaMode, revision: u64) -> Self {
        Self {
            address,
            mode,
            revision,
            rebuilding: false,
            in_flight: 0,
            added_at: chrono::Utc::now(),
        }
    }
}

/// Volume replica summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub total_replicas: usize,
    pub read_write: usize,
    pub write_only: usize,
    pub errored: usize,
    pub write_quorum: usize,
    pub revision: u64,
    pub rebuilding: bool,
}

impl VolumeSummary {
    /// Tally replica modes
    pub fn from_replicas(replicas: &[ReplicaState], write_quorum: usize, revision: u64) -> Self {
        let count = |mode| replicas.iter().filter(|r| r.mode == mode).count();
        Self {
            total_replicas: replicas.len(),
            read_write: count(ReplicaMode::ReadWrite),
            write_only: count(ReplicaMode::WriteOnly),
            errored: count(ReplicaMode::Errored),
            write_quorum,
            revision,
            rebuilding: replicas.iter().any(|r| r.rebuilding),
        }
    }

    /// Enough ReadWrite replicas to accept writes
    pub fn has_quorum(&self) -> bool {
        self.read_write >= self.write_quorum.max(1)
    }
}
