//! Volume Controller
//!
//! Owns the replica set of one volume. Writes are serialized and fanned out
//! to every ReadWrite replica and every rebuild target; a write succeeds
//! once `write_quorum` ReadWrite replicas that are still attached have
//! acknowledged the expected revision. Reads are spread round-robin across
//! ReadWrite replicas and fail over on error. Any replica that fails a
//! request is moved to Errored and stops receiving traffic.

mod backend;
mod rebuild;

pub use backend::{
    LocalConnector, LocalReplica, RemoteConnector, RemoteReplica, ReplicaBackend, ReplicaConnector,
};
pub use rebuild::{RebuildInfo, RebuildStatus, REBUILD_SNAPSHOT_PREFIX};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::chain::{LayerInfo, PrepareRemoveAction};
use crate::config::WolfBlockConfig;
use crate::error::{Error, Result};
use crate::network::MAX_IO_LENGTH;
use crate::replica::ReplicaInfo;
use crate::state::{ReplicaMode, ReplicaState, VolumeSummary};
use crate::sync::{SyncAgent, SyncOptions};
use rebuild::RebuildSession;

/// Controller configuration for one volume
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub name: String,
    pub size: u64,
    pub block_size: u32,
    /// ReadWrite acknowledgements required per write
    pub write_quorum: usize,
    /// Bound on every single-replica request
    pub request_timeout: Duration,
    /// Bound on transferring one layer during a rebuild
    pub sync_timeout: Duration,
    /// Rebuild lagging replicas from `start`
    pub rebuild_on_start: bool,
    /// Largest client read or write
    pub max_io_length: usize,
    pub sync: SyncOptions,
}

impl ControllerOptions {
    /// Options with default timeouts for a volume of `size` bytes
    pub fn new(name: &str, size: u64, block_size: u32) -> Self {
        let defaults = crate::config::ControllerConfig::default();
        Self {
            name: name.to_string(),
            size,
            block_size,
            write_quorum: 1,
            request_timeout: defaults.request_timeout(),
            sync_timeout: defaults.sync_timeout(),
            rebuild_on_start: defaults.rebuild_on_start,
            max_io_length: MAX_IO_LENGTH,
            sync: SyncOptions::default(),
        }
    }

    pub fn from_config(config: &WolfBlockConfig) -> Self {
        Self {
            name: config.volume.name.clone(),
            size: config.volume.size,
            block_size: config.volume.block_size,
            write_quorum: config.volume.write_quorum.max(1),
            request_timeout: config.controller.request_timeout(),
            sync_timeout: config.controller.sync_timeout(),
            rebuild_on_start: config.controller.rebuild_on_start,
            max_io_length: MAX_IO_LENGTH,
            sync: SyncOptions::from(&config.sync),
        }
    }
}

/// Volume description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub size: u64,
    pub block_size: u32,
    pub write_quorum: usize,
    /// Quorum revision counter
    pub revision: u64,
    pub replicas: Vec<ReplicaState>,
}

/// Administrative action on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReplicaAction {
    Open,
    Close,
    Create { size: u64, block_size: u32 },
    SetRevisionCounter { value: u64 },
    SetReplicaMode { mode: ReplicaMode },
    SetLogging { level: String },
    ReplaceDisk { old: String, staged: String },
}

impl ReplicaAction {
    pub fn name(&self) -> &'static str {
        match self {
            ReplicaAction::Open => "open",
            ReplicaAction::Close => "close",
            ReplicaAction::Create { .. } => "create",
            ReplicaAction::SetRevisionCounter { .. } => "setrevisioncounter",
            ReplicaAction::SetReplicaMode { .. } => "setreplicamode",
            ReplicaAction::SetLogging { .. } => "setlogging",
            ReplicaAction::ReplaceDisk { .. } => "replacedisk",
        }
    }

    /// The action changes the replica's open state, counter or mode, so an
    /// attached replica leaves the quorum until it is rebuilt
    fn leaves_quorum(&self) -> bool {
        matches!(
            self,
            ReplicaAction::Close
                | ReplicaAction::SetRevisionCounter { .. }
                | ReplicaAction::SetReplicaMode { .. }
        )
    }
}

/// Volume I/O statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStats {
    pub summary: VolumeSummary,
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Writes rejected with QuorumLost
    pub failed_writes: u64,
    /// Reads retried on another replica
    pub read_failovers: u64,
    /// Replicas moved to Errored
    pub replica_failures: u64,
    pub rebuilds_completed: u64,
    pub rebuilds_failed: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    failed_writes: AtomicU64,
    read_failovers: AtomicU64,
    replica_failures: AtomicU64,
    rebuilds_completed: AtomicU64,
    rebuilds_failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn record_rebuild(&self, completed: bool) {
        if completed {
            Self::bump(&self.rebuilds_completed, 1);
        } else {
            Self::bump(&self.rebuilds_failed, 1);
        }
    }
}

struct ReplicaSlot {
    state: ReplicaState,
    backend: Arc<dyn ReplicaBackend>,
    in_flight: Arc<AtomicUsize>,
}

/// Snapshot of one slot for issuing requests without holding the set lock
#[derive(Clone)]
struct ReplicaHandle {
    address: String,
    mode: ReplicaMode,
    backend: Arc<dyn ReplicaBackend>,
    in_flight: Arc<AtomicUsize>,
}

impl ReplicaHandle {
    fn from_slot(slot: &ReplicaSlot) -> Self {
        Self {
            address: slot.state.address.clone(),
            mode: slot.state.mode,
            backend: slot.backend.clone(),
            in_flight: slot.in_flight.clone(),
        }
    }
}

/// Volume controller
pub struct Controller {
    options: ControllerOptions,
    connector: Arc<dyn ReplicaConnector>,
    size: AtomicU64,
    /// Quorum revision counter
    revision: AtomicU64,
    replicas: RwLock<Vec<ReplicaSlot>>,
    /// Serializes writes, chain actions and rebuild hand-offs
    write_lock: Mutex<()>,
    read_cursor: AtomicUsize,
    rebuilds: RwLock<HashMap<String, Arc<RebuildSession>>>,
    agent: SyncAgent,
    counters: Counters,
}

impl Controller {
    /// Create a controller with no replicas attached
    pub fn new(options: ControllerOptions, connector: Arc<dyn ReplicaConnector>) -> Arc<Self> {
        Arc::new(Self {
            size: AtomicU64::new(options.size),
            revision: AtomicU64::new(0),
            replicas: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
            read_cursor: AtomicUsize::new(0),
            rebuilds: RwLock::new(HashMap::new()),
            agent: SyncAgent::new(options.sync),
            counters: Counters::default(),
            connector,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn block_size(&self) -> u32 {
        self.options.block_size
    }

    /// Quorum revision counter
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn check_io(&self, offset: u64, len: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidState("Empty I/O request".into()));
        }
        if len > self.options.max_io_length {
            return Err(Error::TooLarge(format!(
                "I/O of {} bytes exceeds the {} byte request limit",
                len, self.options.max_io_length
            )));
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(Error::InvalidState(format!(
                "I/O at offset {} length {} is beyond volume size {}",
                offset,
                len,
                self.size()
            ))),
        }
    }

    async fn bounded<T>(
        &self,
        address: &str,
        what: &str,
        request: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.options.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{} on {}", what, address))),
        }
    }

    async fn handles(&self, wanted: impl Fn(&ReplicaState) -> bool) -> Vec<ReplicaHandle> {
        self.replicas
            .read()
            .await
            .iter()
            .filter(|slot| wanted(&slot.state))
            .map(ReplicaHandle::from_slot)
            .collect()
    }

    async fn read_write_targets(&self) -> Vec<ReplicaHandle> {
        self.handles(|s| s.mode == ReplicaMode::ReadWrite).await
    }

    async fn replica_state(&self, address: &str) -> Option<ReplicaState> {
        self.replicas
            .read()
            .await
            .iter()
            .find(|slot| slot.state.address == address)
            .map(|slot| slot.state.clone())
    }

    async fn backend(&self, address: &str) -> Option<Arc<dyn ReplicaBackend>> {
        self.replicas
            .read()
            .await
            .iter()
            .find(|slot| slot.state.address == address)
            .map(|slot| slot.backend.clone())
    }

    /// Apply `f` to the slot of `address`; false when it is not attached
    async fn update_replica(&self, address: &str, f: impl FnOnce(&mut ReplicaState)) -> bool {
        let mut replicas = self.replicas.write().await;
        match replicas.iter_mut().find(|slot| slot.state.address == address) {
            Some(slot) => {
                f(&mut slot.state);
                true
            }
            None => false,
        }
    }

    /// Least loaded ReadWrite replica other than `target`
    async fn pick_source(&self, target: &str) -> Option<ReplicaHandle> {
        self.read_write_targets()
            .await
            .into_iter()
            .filter(|h| h.address != target)
            .min_by_key(|h| h.in_flight.load(Ordering::Relaxed))
    }

    /// Move a replica to Errored and stop any rebuild it takes part in
    async fn mark_errored(&self, address: &str, reason: &str) {
        let backend = {
            let mut replicas = self.replicas.write().await;
            match replicas.iter_mut().find(|slot| slot.state.address == address) {
                Some(slot) if slot.state.mode != ReplicaMode::Errored => {
                    tracing::warn!("Replica {} marked {}: {}", address, ReplicaMode::Errored, reason);
                    slot.state.mode = ReplicaMode::Errored;
                    slot.state.rebuilding = false;
                    slot.backend.clone()
                }
                _ => return,
            }
        };
        Counters::bump(&self.counters.replica_failures, 1);
        self.abort_rebuilds_involving(address, reason).await;

        // Best effort; an unreachable replica stays out of the set regardless
        if let Err(e) = self
            .bounded(address, "set_mode", backend.set_mode(ReplicaMode::Errored))
            .await
        {
            tracing::debug!("Could not tell replica {} it is errored: {}", address, e);
        }
    }

    // ========== Data path ==========

    /// Write `data` at `offset`, returning the revision it was assigned
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u64> {
        self.check_io(offset, data.len())?;
        let required = self.options.write_quorum;
        let client_len = data.len() as u64;

        let _guard = self.write_lock.lock().await;

        // Rebuild targets cannot merge a partial block against layers still in transfer
        let widened = if self.rebuild_target_attached().await {
            match self.widen_to_blocks(offset, data).await {
                Ok(widened) => widened,
                Err(e) => {
                    Counters::bump(&self.counters.failed_writes, 1);
                    return Err(e);
                }
            }
        } else {
            None
        };
        let (offset, data) = match &widened {
            Some((start, blocks)) => (*start, blocks.as_slice()),
            None => (offset, data),
        };

        let targets = self
            .handles(|s| {
                s.mode == ReplicaMode::ReadWrite || (s.mode == ReplicaMode::WriteOnly && s.rebuilding)
            })
            .await;
        if !targets.iter().any(|t| t.mode == ReplicaMode::ReadWrite) {
            Counters::bump(&self.counters.failed_writes, 1);
            return Err(Error::QuorumLost { acked: 0, required });
        }

        let expected = self.revision() + 1;
        let results = join_all(targets.iter().map(|target| async move {
            target.in_flight.fetch_add(1, Ordering::Relaxed);
            let result = self
                .bounded(&target.address, "write", target.backend.write_at(offset, data))
                .await;
            target.in_flight.fetch_sub(1, Ordering::Relaxed);
            result
        }))
        .await;

        let mut acked = Vec::with_capacity(targets.len());
        let mut refused = Vec::new();
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(revision) if revision == expected => acked.push(target.address.as_str()),
                Ok(revision) => {
                    let reason = format!("acknowledged revision {} instead of {}", revision, expected);
                    self.mark_errored(&target.address, &reason).await;
                }
                // Raised before the request left the controller
                Err(Error::TooLarge(reason)) => refused.push((target.address.as_str(), reason)),
                Err(e) => self.mark_errored(&target.address, &e.to_string()).await,
            }
        }

        if acked.is_empty() {
            if let Some((_, reason)) = refused.into_iter().next() {
                Counters::bump(&self.counters.failed_writes, 1);
                return Err(Error::TooLarge(reason));
            }
        } else {
            for (address, reason) in &refused {
                self.mark_errored(address, &format!("missed revision {}: {}", expected, reason))
                    .await;
            }
            self.revision.store(expected, Ordering::SeqCst);
        }

        // Only replicas still attached and ReadWrite count towards the quorum
        let quorum_acks = {
            let mut replicas = self.replicas.write().await;
            let mut count = 0;
            for slot in replicas.iter_mut() {
                if acked.contains(&slot.state.address.as_str()) && slot.state.mode.can_write() {
                    slot.state.revision = expected;
                    if slot.state.mode == ReplicaMode::ReadWrite {
                        count += 1;
                    }
                }
            }
            count
        };

        if quorum_acks < required {
            Counters::bump(&self.counters.failed_writes, 1);
            tracing::error!(
                "Write at {} lost quorum: {}/{} ReadWrite acknowledgements",
                offset,
                quorum_acks,
                required
            );
            return Err(Error::QuorumLost { acked: quorum_acks, required });
        }

        Counters::bump(&self.counters.writes, 1);
        Counters::bump(&self.counters.bytes_written, client_len);
        Ok(expected)
    }

    async fn rebuild_target_attached(&self) -> bool {
        !self
            .handles(|s| s.mode == ReplicaMode::WriteOnly && s.rebuilding)
            .await
            .is_empty()
    }

    /// Expand a partial-block write to whole blocks from the current volume content
    async fn widen_to_blocks(&self, offset: u64, data: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let bs = self.block_size() as u64;
        let end = offset + data.len() as u64;
        let start = offset - offset % bs;
        let aligned_end = end.div_ceil(bs) * bs;
        if start == offset && aligned_end == end {
            return Ok(None);
        }

        let mut blocks = self.read_from_quorum(start, (aligned_end - start) as usize).await?;
        let at = (offset - start) as usize;
        blocks[at..at + data.len()].copy_from_slice(data);
        Ok(Some((start, blocks)))
    }

    /// Read from one ReadWrite replica, failing over to the others
    async fn read_from_quorum(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut candidates = self.read_write_targets().await;
        if candidates.is_empty() {
            return Err(Error::QuorumLost { acked: 0, required: 1 });
        }
        let start = self.read_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.rotate_left(start);

        for (attempt, replica) in candidates.iter().enumerate() {
            if attempt > 0 {
                Counters::bump(&self.counters.read_failovers, 1);
            }
            replica.in_flight.fetch_add(1, Ordering::Relaxed);
            let result = self
                .bounded(&replica.address, "read", replica.backend.read_at(offset, len))
                .await;
            replica.in_flight.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(data) => return Ok(data),
                Err(e @ Error::TooLarge(_)) => return Err(e),
                Err(e) => self.mark_errored(&replica.address, &e.to_string()).await,
            }
        }

        Err(Error::QuorumLost { acked: 0, required: 1 })
    }

    /// Read `len` bytes at `offset` from one ReadWrite replica
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_io(offset, len)?;

        let data = self.read_from_quorum(offset, len).await?;
        Counters::bump(&self.counters.reads, 1);
        Counters::bump(&self.counters.bytes_read, data.len() as u64);
        Ok(data)
    }

    // ========== Membership ==========

    /// Connect to a replica and make sure its chain is open
    async fn attach(&self, address: &str) -> Result<(Arc<dyn ReplicaBackend>, ReplicaInfo)> {
        let backend = self.connector.connect(address).await?;
        let info = self.bounded(address, "info", backend.info()).await?;
        if !info.open {
            match self.bounded(address, "open", backend.open()).await {
                Ok(()) => {}
                Err(Error::NotFound(_)) => {
                    tracing::info!("Creating empty replica on {}", address);
                    self.bounded(
                        address,
                        "create",
                        backend.create(self.size(), self.options.block_size),
                    )
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }

        let info = self.bounded(address, "info", backend.info()).await?;
        if info.block_size != self.options.block_size {
            return Err(Error::InvalidState(format!(
                "Replica {} uses block size {}, volume uses {}",
                address, info.block_size, self.options.block_size
            )));
        }
        Ok((backend, info))
    }

    /// Attach the initial replica set.
    ///
    /// The ReadWrite replicas with the highest revision form the quorum;
    /// every other replica is errored and, when configured, rebuilt.
    pub async fn start(self: &Arc<Self>, addresses: &[String]) -> Result<()> {
        if !self.replicas.read().await.is_empty() {
            return Err(Error::InvalidState(format!("Volume {} is already started", self.name())));
        }

        let mut attached: Vec<(String, Arc<dyn ReplicaBackend>, ReplicaInfo)> = Vec::new();
        for address in addresses {
            if attached.iter().any(|(a, _, _)| a == address) {
                continue;
            }
            match self.attach(address).await {
                Ok((backend, info)) => attached.push((address.clone(), backend, info)),
                Err(e) => tracing::warn!("Replica {} unavailable at start: {}", address, e),
            }
        }

        let revision = attached
            .iter()
            .filter(|(_, _, info)| info.mode == ReplicaMode::ReadWrite)
            .map(|(_, _, info)| info.revision)
            .max()
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "No ReadWrite replica available to start volume {}",
                    self.name()
                ))
            })?;

        let mut lagging = Vec::new();
        {
            let mut replicas = self.replicas.write().await;
            for (address, backend, info) in attached {
                let current = info.mode == ReplicaMode::ReadWrite && info.revision == revision;
                let mode = if current {
                    if info.size > self.size() {
                        self.size.store(info.size, Ordering::SeqCst);
                    }
                    ReplicaMode::ReadWrite
                } else {
                    tracing::warn!(
                        "Replica {} is behind (mode {}, revision {} < {})",
                        address,
                        info.mode,
                        info.revision,
                        revision
                    );
                    lagging.push((address.clone(), backend.clone(), info.mode));
                    ReplicaMode::Errored
                };
                replicas.push(ReplicaSlot {
                    state: ReplicaState::new(address, mode, info.revision),
                    backend,
                    in_flight: Arc::new(AtomicUsize::new(0)),
                });
            }
        }
        self.revision.store(revision, Ordering::SeqCst);

        tracing::info!(
            "Volume {} started at revision {} with {} lagging replicas",
            self.name(),
            revision,
            lagging.len()
        );

        for (address, backend, mode) in lagging {
            if mode == ReplicaMode::ReadWrite {
                if let Err(e) = self
                    .bounded(&address, "set_mode", backend.set_mode(ReplicaMode::Errored))
                    .await
                {
                    tracing::warn!("Could not demote lagging replica {}: {}", address, e);
                }
            }
            if self.options.rebuild_on_start {
                self.start_rebuild(&address).await?;
            }
        }
        Ok(())
    }

    /// Attach a replica. The first replica of an empty volume joins as
    /// ReadWrite; any later one joins WriteOnly and is rebuilt.
    pub async fn add_replica(self: &Arc<Self>, address: &str) -> Result<()> {
        if self.replica_state(address).await.is_some() {
            return Err(Error::InvalidState(format!("Replica {} is already attached", address)));
        }
        let (backend, info) = self.attach(address).await?;

        let bootstrap = {
            let _guard = self.write_lock.lock().await;
            let mut replicas = self.replicas.write().await;
            if replicas.iter().any(|slot| slot.state.address == address) {
                return Err(Error::InvalidState(format!("Replica {} is already attached", address)));
            }

            let bootstrap = replicas.is_empty();
            let mode = if bootstrap {
                if info.mode != ReplicaMode::ReadWrite {
                    return Err(Error::InvalidState(format!(
                        "First replica {} must be ReadWrite, it is {}",
                        address, info.mode
                    )));
                }
                self.revision.store(info.revision, Ordering::SeqCst);
                self.size.store(info.size.max(self.size()), Ordering::SeqCst);
                ReplicaMode::ReadWrite
            } else if info.revision > self.revision() {
                drop(replicas);
                tracing::error!(
                    "Replica {} at revision {} is ahead of volume revision {}, rejecting",
                    address,
                    info.revision,
                    self.revision()
                );
                if let Err(e) = self
                    .bounded(address, "set_mode", backend.set_mode(ReplicaMode::Errored))
                    .await
                {
                    tracing::warn!("Could not mark replica {} errored: {}", address, e);
                }
                return Err(Error::InvalidState(format!(
                    "Replica {} revision {} is ahead of volume revision {}",
                    address,
                    info.revision,
                    self.revision()
                )));
            } else {
                ReplicaMode::WriteOnly
            };

            replicas.push(ReplicaSlot {
                state: ReplicaState::new(address.to_string(), mode, info.revision),
                backend,
                in_flight: Arc::new(AtomicUsize::new(0)),
            });
            bootstrap
        };

        if bootstrap {
            tracing::info!("Replica {} bootstraps volume {}", address, self.name());
            Ok(())
        } else {
            tracing::info!("Replica {} added, scheduling rebuild", address);
            self.start_rebuild(address).await
        }
    }

    /// Detach a replica; a rebuild targeting or sourcing from it is cancelled
    pub async fn rm_replica(&self, address: &str) -> Result<()> {
        let removed = {
            let mut replicas = self.replicas.write().await;
            match replicas.iter().position(|slot| slot.state.address == address) {
                Some(i) => replicas.remove(i),
                None => return Err(Error::NotFound(format!("Replica {} is not attached", address))),
            }
        };
        self.abort_rebuilds_involving(address, "removed from the volume").await;
        self.forget_rebuild(address).await;
        tracing::info!("Replica {} removed (mode {})", address, removed.state.mode);
        Ok(())
    }

    /// Controller view of every replica
    pub async fn ls_replicas(&self) -> Vec<ReplicaState> {
        self.replicas
            .read()
            .await
            .iter()
            .map(|slot| {
                let mut state = slot.state.clone();
                state.in_flight = slot.in_flight.load(Ordering::Relaxed);
                state
            })
            .collect()
    }

    pub async fn info(&self) -> VolumeInfo {
        VolumeInfo {
            name: self.name().to_string(),
            size: self.size(),
            block_size: self.block_size(),
            write_quorum: self.options.write_quorum,
            revision: self.revision(),
            replicas: self.ls_replicas().await,
        }
    }

    pub async fn stats(&self) -> VolumeStats {
        let replicas = self.ls_replicas().await;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        VolumeStats {
            summary: VolumeSummary::from_replicas(&replicas, self.options.write_quorum, self.revision()),
            reads: load(&self.counters.reads),
            writes: load(&self.counters.writes),
            bytes_read: load(&self.counters.bytes_read),
            bytes_written: load(&self.counters.bytes_written),
            failed_writes: load(&self.counters.failed_writes),
            read_failovers: load(&self.counters.read_failovers),
            replica_failures: load(&self.counters.replica_failures),
            rebuilds_completed: load(&self.counters.rebuilds_completed),
            rebuilds_failed: load(&self.counters.rebuilds_failed),
        }
    }

    // ========== Chain actions ==========

    /// Run a chain action on every ReadWrite replica.
    ///
    /// A rejection from the first replica aborts the action; any later
    /// failure means that replica's chain diverged, so it is errored.
    async fn apply_to_read_write<F, Fut>(&self, what: &str, action: F) -> Result<()>
    where
        F: Fn(Arc<dyn ReplicaBackend>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let replicas = self.read_write_targets().await;
        let required = self.options.write_quorum;
        if replicas.is_empty() {
            return Err(Error::QuorumLost { acked: 0, required });
        }

        let mut applied = 0;
        for replica in replicas {
            match self
                .bounded(&replica.address, what, action(replica.backend.clone()))
                .await
            {
                Ok(()) => applied += 1,
                Err(e) if applied == 0 && e.is_rejection() => return Err(e),
                Err(e) => {
                    self.mark_errored(&replica.address, &format!("{} failed: {}", what, e))
                        .await;
                }
            }
        }

        if applied < required {
            return Err(Error::QuorumLost { acked: applied, required });
        }
        Ok(())
    }

    async fn require_no_rebuild(&self, action: &str) -> Result<()> {
        if self.rebuild_active().await {
            return Err(Error::ChainBusy(format!("Cannot {} while a rebuild is running", action)));
        }
        Ok(())
    }

    /// Snapshot the volume, generating a name when none is given
    pub async fn snapshot(&self, name: Option<String>) -> Result<String> {
        let _guard = self.write_lock.lock().await;
        self.require_no_rebuild("snapshot").await?;

        let name = name.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.apply_to_read_write("snapshot", |backend| {
            let name = name.clone();
            async move { backend.snapshot(&name).await }
        })
        .await?;

        tracing::info!("Volume {} snapshot {} at revision {}", self.name(), name, self.revision());
        Ok(name)
    }

    /// Mark snapshot `name` as the current checkpoint
    pub async fn set_checkpoint(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.require_no_rebuild("set a checkpoint").await?;
        self.apply_to_read_write("set_checkpoint", |backend| {
            let name = name.to_string();
            async move { backend.set_checkpoint(&name).await }
        })
        .await
    }

    /// Revert the volume to snapshot `name`
    pub async fn revert(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.rebuild_active().await {
            return Err(Error::InvalidState("Cannot revert while a rebuild is running".into()));
        }
        self.apply_to_read_write("revert", |backend| {
            let name = name.to_string();
            async move { backend.revert(&name).await }
        })
        .await?;

        tracing::info!("Volume {} reverted to {}", self.name(), name);
        Ok(())
    }

    /// Grow the volume to `size` bytes
    pub async fn resize(&self, size: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.require_no_rebuild("resize").await?;
        if size % self.block_size() as u64 != 0 || size < self.size() {
            return Err(Error::InvalidState(format!(
                "Cannot resize volume from {} to {} with block size {}",
                self.size(),
                size,
                self.block_size()
            )));
        }

        self.apply_to_read_write("resize", |backend| async move { backend.resize(size).await })
            .await?;
        self.size.store(size, Ordering::SeqCst);
        Ok(())
    }

    /// Remove snapshot `name`, folding it into its child.
    ///
    /// Every ReadWrite replica validates the removal before any of them
    /// changes its chain.
    pub async fn remove_snapshot(&self, name: &str) -> Result<Vec<PrepareRemoveAction>> {
        let _guard = self.write_lock.lock().await;
        self.require_no_rebuild("remove a snapshot").await?;

        let mut plan = None;
        for replica in self.read_write_targets().await {
            let planned = self
                .bounded(&replica.address, "prepare_remove", replica.backend.prepare_remove_disk(name))
                .await;
            match planned {
                Ok(actions) => {
                    plan.get_or_insert(actions);
                }
                Err(e) if e.is_rejection() => return Err(e),
                Err(e) => {
                    self.mark_errored(&replica.address, &format!("prepare_remove failed: {}", e))
                        .await;
                }
            }
        }
        let plan = plan.ok_or(Error::QuorumLost {
            acked: 0,
            required: self.options.write_quorum,
        })?;

        self.apply_to_read_write("remove_disk", |backend| {
            let name = name.to_string();
            async move { backend.remove_disk(&name).await }
        })
        .await?;

        tracing::info!("Volume {} snapshot {} removed", self.name(), name);
        Ok(plan)
    }

    /// Run an administrative action on one replica, attached or not
    pub async fn replica_action(&self, address: &str, action: ReplicaAction) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let attached = self.backend(address).await;
        let backend = match &attached {
            Some(backend) => backend.clone(),
            None => self.connector.connect(address).await?,
        };

        let name = action.name();
        match &action {
            ReplicaAction::Open => self.bounded(address, name, backend.open()).await?,
            ReplicaAction::Close => self.bounded(address, name, backend.close()).await?,
            ReplicaAction::Create { size, block_size } => {
                self.bounded(address, name, backend.create(*size, *block_size))
                    .await?
            }
            ReplicaAction::SetRevisionCounter { value } => {
                self.bounded(address, name, backend.set_revision_counter(*value))
                    .await?
            }
            ReplicaAction::SetReplicaMode { mode } => {
                self.bounded(address, name, backend.set_replica_mode(*mode))
                    .await?
            }
            ReplicaAction::SetLogging { level } => {
                self.bounded(address, name, backend.set_logging(level)).await?
            }
            ReplicaAction::ReplaceDisk { old, staged } => {
                self.bounded(address, name, backend.replace_disk(old, staged))
                    .await?
            }
        }
        tracing::info!("Replica {} action {} applied", address, name);

        if attached.is_some() && action.leaves_quorum() {
            self.mark_errored(address, &format!("operator ran {}", name)).await;
        }
        Ok(())
    }

    /// Chain of the first reachable ReadWrite replica, head first
    pub async fn layers(&self) -> Result<Vec<LayerInfo>> {
        for replica in self.read_write_targets().await {
            match self.bounded(&replica.address, "info", replica.backend.info()).await {
                Ok(info) => return Ok(info.layers),
                Err(e) => tracing::warn!("Could not list layers on {}: {}", replica.address, e),
            }
        }
        Err(Error::QuorumLost { acked: 0, required: 1 })
    }

    /// Cancel running rebuilds and wait for them to stop
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<RebuildSession>> =
            self.rebuilds.read().await.values().cloned().collect();
        for session in &sessions {
            if session.is_active() {
                session.cancel();
            }
        }
        for session in sessions {
            session.wait().await;
        }
        tracing::info!("Volume {} controller stopped", self.name());
    }
}
