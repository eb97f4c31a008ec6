//! Replica Agent
//!
//! Wraps one snapshot chain and its revision counter, enforces the replica
//! mode state machine and applies requests strictly in arrival order.

mod server;

pub use server::ReplicaServer;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::chain::{
    BlockChecksum, BlockRange, ChainOptions, ChainStore, LayerInfo, LayerView, PrepareRemoveAction,
};
use crate::error::{Error, Result};
use crate::logging::LogLevelControl;
use crate::revision::RevisionCounter;
use crate::state::ReplicaMode;

/// Replica status as reported to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Replica directory
    pub dir: String,
    /// Chain is open
    pub open: bool,
    pub size: u64,
    pub block_size: u32,
    /// Current revision counter
    pub revision: u64,
    pub mode: ReplicaMode,
    /// A rebuild is reconciling the chain
    pub rebuilding: bool,
    /// Chain layers, head first
    pub layers: Vec<LayerInfo>,
}

struct ReplicaInner {
    store: Option<ChainStore>,
    counter: RevisionCounter,
    mode: ReplicaMode,
}

impl ReplicaInner {
    fn store(&self) -> Result<&ChainStore> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Replica is closed".into()))
    }

    fn store_mut(&mut self) -> Result<&mut ChainStore> {
        self.store
            .as_mut()
            .ok_or_else(|| Error::InvalidState("Replica is closed".into()))
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode.can_write() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!("Replica in mode {} rejects writes", self.mode)))
        }
    }

    fn check_io(&self, offset: u64, len: usize) -> Result<()> {
        let size = self.store()?.size();
        if len == 0 {
            return Err(Error::InvalidState("Empty I/O request".into()));
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(()),
            _ => Err(Error::InvalidState(format!(
                "I/O at offset {} length {} is beyond volume size {}",
                offset, len, size
            ))),
        }
    }

    fn persist_mode(&mut self) {
        let mode = self.mode;
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.persist_mode(mode) {
                tracing::error!("Failed to persist replica mode {}: {}", mode, e);
            }
        }
    }

    fn transition(&mut self, next: ReplicaMode) -> Result<()> {
        let next = self.mode.transition(next)?;
        if next != self.mode {
            tracing::info!("Replica mode {} -> {}", self.mode, next);
            self.mode = next;
            self.persist_mode();
        }
        Ok(())
    }

    fn fail(&mut self, reason: &str) {
        if self.mode != ReplicaMode::Errored {
            tracing::error!("Replica entering {} after failure: {}", ReplicaMode::Errored, reason);
            self.mode = ReplicaMode::Errored;
            self.persist_mode();
        }
    }
}

/// Replica agent bound to one directory
pub struct Replica {
    dir: PathBuf,
    options: ChainOptions,
    inner: Mutex<ReplicaInner>,
    log_control: Option<LogLevelControl>,
}

impl Replica {
    /// Create a closed replica agent for `dir`
    pub fn new(dir: PathBuf, options: ChainOptions) -> Self {
        Self {
            dir,
            options,
            inner: Mutex::new(ReplicaInner {
                store: None,
                counter: RevisionCounter::default(),
                mode: ReplicaMode::Errored,
            }),
            log_control: None,
        }
    }

    /// Allow `set_logging` to change the process log level
    pub fn with_log_control(mut self, control: LogLevelControl) -> Self {
        self.log_control = Some(control);
        self
    }

    /// Replica directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn label(&self) -> String {
        self.dir.display().to_string()
    }

    /// Initialize a fresh empty chain and open it
    pub async fn create(&self, size: u64, block_size: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.store.is_some() {
            return Err(Error::InvalidState("Replica is already open".into()));
        }

        let store = ChainStore::create(self.dir.clone(), size, block_size, self.options)?;
        inner.counter.set(0);
        inner.mode = store.persisted_mode()?;
        inner.store = Some(store);
        Ok(())
    }

    /// Open an existing chain, recovering counter and mode
    pub async fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.store.is_some() {
            return Ok(());
        }

        let store = ChainStore::open(self.dir.clone(), self.options)?;
        let revision = store.recovered_revision()?;
        inner.counter.set(revision);
        inner.mode = store.persisted_mode()?;
        tracing::info!(
            "Replica {} open at revision {} in mode {}",
            self.label(),
            revision,
            inner.mode
        );
        inner.store = Some(store);
        Ok(())
    }

    /// Open the chain when one exists, otherwise create it
    pub async fn open_or_create(&self, size: u64, block_size: u32) -> Result<()> {
        if ChainStore::exists(&self.dir)? {
            self.open().await
        } else {
            self.create(size, block_size).await
        }
    }

    /// Release the chain on request of an operator.
    ///
    /// A ReadWrite replica drops out of the quorum, so it moves to Errored
    /// and has to be rebuilt before it serves again.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.store.is_none() {
            return Ok(());
        }
        if inner.mode == ReplicaMode::ReadWrite {
            inner.transition(ReplicaMode::Errored)?;
        }
        inner.store = None;
        tracing::info!("Replica {} closed in mode {}", self.label(), inner.mode);
        Ok(())
    }

    /// Release the chain at process exit, keeping the persisted mode
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(store) = inner.store.take() {
            store.flush_head()?;
            tracing::info!("Replica {} released at revision {}", self.label(), inner.counter.get());
        }
        Ok(())
    }

    /// Current status
    pub async fn info(&self) -> Result<ReplicaInfo> {
        let inner = self.inner.lock().await;
        let info = match inner.store.as_ref() {
            Some(store) => ReplicaInfo {
                dir: self.label(),
                open: true,
                size: store.size(),
                block_size: store.block_size(),
                revision: inner.counter.get(),
                mode: inner.mode,
                rebuilding: store.rebuilding(),
                layers: store.layers(),
            },
            None => ReplicaInfo {
                dir: self.label(),
                open: false,
                size: 0,
                block_size: 0,
                revision: inner.counter.get(),
                mode: inner.mode,
                rebuilding: false,
                layers: Vec::new(),
            },
        };
        Ok(info)
    }

    /// Current revision counter
    pub async fn revision(&self) -> u64 {
        self.inner.lock().await.counter.get()
    }

    /// Current mode
    pub async fn mode(&self) -> ReplicaMode {
        self.inner.lock().await.mode
    }

    /// Read through the chain (ReadWrite only)
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        if !inner.mode.can_read() {
            return Err(Error::InvalidState(format!(
                "Replica in mode {} cannot serve reads",
                inner.mode
            )));
        }
        inner.check_io(offset, len)?;

        let result = inner.store()?.read_at(offset, len);
        match result {
            Ok(data) => Ok(data),
            Err(e) => {
                inner.fail(&e.to_string());
                Err(e)
            }
        }
    }

    /// Apply a write and bump the counter as one durable step
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.require_writable()?;
        inner.check_io(offset, data.len())?;

        let revision = inner.counter.next();
        let applied = inner.store_mut()?.write_at(offset, data, revision);
        match applied {
            Ok(()) => {
                inner.counter.advance_to(revision);
                tracing::trace!("Applied write at {} ({} bytes) as revision {}", offset, data.len(), revision);
                Ok(revision)
            }
            Err(e) => {
                let reason = e.to_string();
                inner.fail(&reason);
                Err(Error::WriteFailed {
                    replica: self.label(),
                    reason,
                })
            }
        }
    }

    /// Freeze the head as snapshot `name`
    pub async fn snapshot(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_writable()?;
        let revision = inner.counter.get();
        inner.store_mut()?.snapshot(name, revision)
    }

    /// Mark `name` as the current checkpoint
    pub async fn set_checkpoint(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_writable()?;
        inner.store_mut()?.set_checkpoint(name)
    }

    /// Revert the chain to snapshot `name`
    pub async fn revert(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.mode.can_write() {
            return Err(Error::InvalidState(format!(
                "Cannot revert a replica in mode {}",
                inner.mode
            )));
        }
        let revision = inner.counter.get();
        inner.store_mut()?.revert(name, revision)
    }

    /// Grow the volume
    pub async fn resize(&self, size: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_writable()?;
        inner.store_mut()?.resize(size)
    }

    /// Validate removal of a layer without changing the chain
    pub async fn prepare_remove_disk(&self, name: &str) -> Result<Vec<PrepareRemoveAction>> {
        let inner = self.inner.lock().await;
        inner.store()?.prepare_remove_disk(name)
    }

    /// Fold a layer into the head and unlink it
    pub async fn remove_disk(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_writable()?;
        let revision = inner.counter.get();
        inner.store_mut()?.remove_disk(name, revision)
    }

    /// Swap the file backing `old` for a staged layer file
    pub async fn replace_disk(&self, old: &str, staged: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_writable()?;
        inner.store_mut()?.replace_disk(old, staged)
    }

    /// Administrative counter override
    pub async fn set_revision_counter(&self, value: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let previous = inner.counter.get();
        inner.store_mut()?.persist_revision(value)?;
        inner.counter.set(value);
        tracing::warn!(
            target: "audit",
            replica = %self.label(),
            previous,
            value,
            "setRevisionCounter override"
        );
        Ok(())
    }

    /// Administrative mode override, bypassing the state machine
    pub async fn set_replica_mode(&self, mode: ReplicaMode) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let previous = inner.mode;
        inner.store_mut()?.persist_mode(mode)?;
        inner.mode = mode;
        tracing::warn!(
            target: "audit",
            replica = %self.label(),
            previous = %previous,
            mode = %mode,
            "setReplicaMode override"
        );
        Ok(())
    }

    /// Mode change through the state machine
    pub async fn set_mode(&self, mode: ReplicaMode) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.transition(mode)
    }

    /// Change the process log level
    pub async fn set_logging(&self, level: &str) -> Result<()> {
        match &self.log_control {
            Some(control) => control.set_level(level),
            None => Err(Error::InvalidState("Log level control is not installed".into())),
        }
    }

    /// Reconcile the chain to a rebuild source and enter WriteOnly at `revision`
    pub async fn prepare_rebuild(&self, layers: &[LayerInfo], size: u64, revision: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.store()?;

        if inner.mode == ReplicaMode::ReadWrite {
            inner.transition(ReplicaMode::Errored)?;
        }
        if !inner.mode.can_transition_to(ReplicaMode::WriteOnly) {
            return Err(Error::InvalidState(format!(
                "Cannot rebuild a replica in mode {}",
                inner.mode
            )));
        }

        inner.store_mut()?.prepare_rebuild(layers, size, revision)?;
        inner.counter.set(revision);
        inner.transition(ReplicaMode::WriteOnly)?;
        Ok(())
    }

    /// Finish a rebuild once the counter matches the quorum counter
    pub async fn finish_rebuild(&self, expected_revision: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.mode != ReplicaMode::WriteOnly || !inner.store()?.rebuilding() {
            return Err(Error::InvalidState(format!(
                "No rebuild to finish in mode {}",
                inner.mode
            )));
        }

        let revision = inner.counter.get();
        if revision != expected_revision {
            return Err(Error::InvalidState(format!(
                "Revision counter {} does not match quorum counter {}",
                revision, expected_revision
            )));
        }

        inner.store_mut()?.finish_rebuild()?;
        inner.transition(ReplicaMode::ReadWrite)?;
        tracing::info!("Replica {} rebuilt at revision {}", self.label(), revision);
        Ok(())
    }

    /// Per-block digests of a layer within `range`
    pub async fn digests(&self, layer: &str, view: LayerView, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        let inner = self.inner.lock().await;
        inner.store()?.digests(layer, view, range)
    }

    /// Read a block range of a layer
    pub async fn read_range(&self, layer: &str, range: BlockRange, view: LayerView) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner.store()?.read_range(layer, range, view)
    }

    fn require_rebuilding(inner: &ReplicaInner) -> Result<()> {
        if inner.store()?.rebuilding() {
            Ok(())
        } else {
            Err(Error::InvalidState("Layer transfer outside of a rebuild".into()))
        }
    }

    /// Write transferred blocks into an inactive layer
    pub async fn apply_range(&self, layer: &str, first: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::require_rebuilding(&inner)?;
        inner.store_mut()?.apply_range(layer, first, data)
    }

    /// Un-allocate blocks of an inactive layer
    pub async fn trim_range(&self, layer: &str, range: BlockRange) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::require_rebuilding(&inner)?;
        inner.store_mut()?.trim_range(layer, range)
    }

    /// Flush an inactive layer after a transfer
    pub async fn flush_layer(&self, layer: &str) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.store()?.flush_layer(layer)
    }
}
