//! Replica Rebuild
//!
//! Brings a lagging replica back into the quorum. Under the write lock the
//! healthy replicas are snapshotted, the target's chain is reconciled to
//! the source's layer list and the target starts receiving live writes in
//! WriteOnly mode. Frozen layers are then diff-synced without the lock,
//! and the target is promoted once its counter matches the quorum counter.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::Controller;
use crate::chain::LayerView;
use crate::error::{Error, Result};
use crate::state::ReplicaMode;
use crate::sync::{RangeDone, SyncReport};

/// Name prefix of the snapshots a rebuild takes on the healthy replicas
pub const REBUILD_SNAPSHOT_PREFIX: &str = "rebuild-";

/// Rebuild progress state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RebuildStatus {
    Preparing,
    Transferring,
    Finishing,
    Completed,
    Failed(String),
    Cancelled,
}

impl RebuildStatus {
    /// The session has ended, successfully or not
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RebuildStatus::Completed | RebuildStatus::Failed(_) | RebuildStatus::Cancelled
        )
    }
}

/// Progress of one rebuild, as reported by `rebuild-info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildInfo {
    /// Replica being rebuilt
    pub target: String,
    /// ReadWrite replica the layers are copied from
    pub source: Option<String>,
    pub status: RebuildStatus,
    /// Quorum counter the target was reset to
    pub revision: u64,
    /// Snapshot taken on the healthy replicas
    pub snapshot: Option<String>,
    pub layers_total: usize,
    pub layers_done: usize,
    /// Layer currently being transferred
    pub current_layer: Option<String>,
    pub ranges_completed: usize,
    pub ranges_total: usize,
    /// Accumulated transfer statistics
    pub report: SyncReport,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub(crate) struct RebuildSession {
    info: Mutex<RebuildInfo>,
    abort_reason: Mutex<Option<String>>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RebuildSession {
    pub(crate) fn new(target: &str) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            info: Mutex::new(RebuildInfo {
                target: target.to_string(),
                source: None,
                status: RebuildStatus::Preparing,
                revision: 0,
                snapshot: None,
                layers_total: 0,
                layers_done: 0,
                current_layer: None,
                ranges_completed: 0,
                ranges_total: 0,
                report: SyncReport::default(),
                started_at: chrono::Utc::now(),
                finished_at: None,
            }),
            abort_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            done,
        })
    }

    pub(crate) fn info(&self) -> RebuildInfo {
        lock(&self.info).clone()
    }

    fn update(&self, f: impl FnOnce(&mut RebuildInfo)) {
        f(&mut lock(&self.info));
    }

    pub(crate) fn is_active(&self) -> bool {
        !lock(&self.info).status.is_finished()
    }

    /// Replica on either side of the transfer
    pub(crate) fn involves(&self, address: &str) -> bool {
        let info = lock(&self.info);
        info.target == address || info.source.as_deref() == Some(address)
    }

    /// Stop the session at the next range boundary
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the session and report it as failed with `reason`
    pub(crate) fn abort(&self, reason: String) {
        lock(&self.abort_reason).get_or_insert(reason);
        self.cancel.cancel();
    }

    fn finish(&self, status: RebuildStatus) {
        self.update(|info| {
            info.status = status;
            info.current_layer = None;
            info.finished_at = Some(chrono::Utc::now());
        });
        self.done.send_replace(true);
    }

    /// Wait until the session has ended
    pub(crate) async fn wait(&self) -> RebuildInfo {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
        self.info()
    }
}

impl Controller {
    /// Start rebuilding `address` in the background
    pub async fn start_rebuild(self: &Arc<Self>, address: &str) -> Result<()> {
        if self.replica_state(address).await.is_none() {
            return Err(Error::NotFound(format!("Replica {} is not attached", address)));
        }

        let session = {
            let mut rebuilds = self.rebuilds.write().await;
            if rebuilds.get(address).map(|s| s.is_active()).unwrap_or(false) {
                return Err(Error::ChainBusy(format!(
                    "Replica {} is already being rebuilt",
                    address
                )));
            }
            let session = RebuildSession::new(address);
            rebuilds.insert(address.to_string(), session.clone());
            session
        };

        tracing::info!("Starting rebuild of replica {}", address);
        let controller = self.clone();
        let target = address.to_string();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(controller.rebuild(&target, &session))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Fatal(format!("Rebuild of {} panicked", target))));
            controller.complete_rebuild(&target, &session, result).await;
        });
        Ok(())
    }

    async fn rebuild(&self, target: &str, session: &RebuildSession) -> Result<()> {
        let (source, target_backend, layers) = {
            let _guard = self.write_lock.lock().await;

            let target_backend = self
                .backend(target)
                .await
                .ok_or_else(|| Error::NotFound(format!("Replica {} is not attached", target)))?;
            let source = self.pick_source(target).await.ok_or_else(|| {
                Error::InvalidState("No ReadWrite replica to rebuild from".into())
            })?;

            let snapshot = format!("{}{}", REBUILD_SNAPSHOT_PREFIX, uuid::Uuid::new_v4());
            session.update(|info| {
                info.source = Some(source.address.clone());
                info.snapshot = Some(snapshot.clone());
            });

            for replica in self.read_write_targets().await {
                let taken = self
                    .bounded(&replica.address, "snapshot", replica.backend.snapshot(&snapshot))
                    .await;
                if let Err(e) = taken {
                    if replica.address == source.address {
                        return Err(Error::Transfer(format!(
                            "Snapshot {} failed on source {}: {}",
                            snapshot, source.address, e
                        )));
                    }
                    self.mark_errored(&replica.address, &format!("snapshot {} failed: {}", snapshot, e))
                        .await;
                }
            }

            let layers = self
                .bounded(&source.address, "info", source.backend.info())
                .await?
                .layers;
            let revision = self.revision();
            self.bounded(
                target,
                "prepare_rebuild",
                target_backend.prepare_rebuild(&layers, self.size(), revision),
            )
            .await?;

            let attached = self
                .update_replica(target, |state| {
                    state.mode = ReplicaMode::WriteOnly;
                    state.rebuilding = true;
                    state.revision = revision;
                })
                .await;
            if !attached {
                return Err(Error::NotFound(format!("Replica {} was removed", target)));
            }

            session.update(|info| {
                info.status = RebuildStatus::Transferring;
                info.revision = revision;
                info.layers_total = layers.iter().filter(|l| !l.head).count();
            });
            (source, target_backend, layers)
        };

        // Base first, so parents are complete before their children
        let compress = self.agent.options().compression;
        let blocks = self.size() / self.block_size() as u64;
        for layer in layers.iter().rev().filter(|l| !l.head) {
            session.update(|info| {
                info.current_layer = Some(layer.name.clone());
                info.ranges_completed = 0;
                info.ranges_total = 0;
            });

            let from = source.backend.source(&layer.name, LayerView::Own, compress);
            let into = target_backend.sink(&layer.name);
            let progress = |done: RangeDone| {
                session.update(|info| {
                    info.ranges_completed = done.completed;
                    info.ranges_total = done.total;
                });
            };

            let transfer = self.agent.transfer(
                from.as_ref(),
                into.as_ref(),
                blocks,
                &session.cancel,
                &progress,
            );
            let report = match tokio::time::timeout(self.options.sync_timeout, transfer).await {
                Ok(report) => report?,
                Err(_) => {
                    return Err(Error::Timeout(format!("transfer of layer {}", layer.name)));
                }
            };

            tracing::debug!(
                "Rebuild of {}: layer {} done, {} blocks copied, {} skipped",
                target,
                layer.name,
                report.blocks_transferred,
                report.blocks_skipped
            );
            session.update(|info| {
                info.layers_done += 1;
                info.report.merge(&report);
            });
        }

        session.update(|info| {
            info.status = RebuildStatus::Finishing;
            info.current_layer = None;
        });

        let _guard = self.write_lock.lock().await;
        if session.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.replica_state(target).await {
            Some(state) if state.mode == ReplicaMode::WriteOnly && state.rebuilding => {}
            Some(state) => {
                return Err(Error::InvalidState(format!(
                    "Replica {} left the rebuild in mode {}",
                    target, state.mode
                )));
            }
            None => return Err(Error::NotFound(format!("Replica {} was removed", target))),
        }

        let revision = self.revision();
        self.bounded(target, "finish_rebuild", target_backend.finish_rebuild(revision))
            .await?;
        self.update_replica(target, |state| {
            state.mode = ReplicaMode::ReadWrite;
            state.rebuilding = false;
            state.revision = revision;
        })
        .await;

        tracing::info!("Replica {} rebuilt and back in quorum at revision {}", target, revision);
        self.prune_rebuild_snapshots().await;
        Ok(())
    }

    /// Fold leftover rebuild snapshots into their children on every
    /// ReadWrite replica. Called under the write lock by the session that
    /// just promoted its target.
    async fn prune_rebuild_snapshots(&self) {
        let active = self
            .rebuilds
            .read()
            .await
            .values()
            .filter(|s| s.is_active())
            .count();
        if active > 1 {
            tracing::debug!("Other rebuilds running, keeping rebuild snapshots");
            return;
        }

        for replica in self.read_write_targets().await {
            let layers = match self
                .bounded(&replica.address, "info", replica.backend.info())
                .await
            {
                Ok(info) => info.layers,
                Err(e) => {
                    self.mark_errored(&replica.address, &format!("info failed: {}", e))
                        .await;
                    continue;
                }
            };

            let stale = layers.iter().filter(|l| {
                !l.head && !l.checkpoint && l.name.starts_with(REBUILD_SNAPSHOT_PREFIX)
            });
            for layer in stale {
                let removed = match self
                    .bounded(
                        &replica.address,
                        "prepare_remove",
                        replica.backend.prepare_remove_disk(&layer.name),
                    )
                    .await
                {
                    Ok(_) => {
                        self.bounded(
                            &replica.address,
                            "remove_disk",
                            replica.backend.remove_disk(&layer.name),
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };

                match removed {
                    Ok(()) => tracing::debug!(
                        "Removed rebuild snapshot {} from {}",
                        layer.name,
                        replica.address
                    ),
                    Err(e) if e.is_rejection() => tracing::warn!(
                        "Keeping rebuild snapshot {} on {}: {}",
                        layer.name,
                        replica.address,
                        e
                    ),
                    Err(e) => {
                        self.mark_errored(
                            &replica.address,
                            &format!("removing {} failed: {}", layer.name, e),
                        )
                        .await;
                        break;
                    }
                }
            }
        }
    }

    async fn complete_rebuild(&self, target: &str, session: &RebuildSession, result: Result<()>) {
        let status = match result {
            Ok(()) => {
                self.counters.record_rebuild(true);
                RebuildStatus::Completed
            }
            Err(e) => {
                self.counters.record_rebuild(false);
                let status = match (lock(&session.abort_reason).clone(), e) {
                    (Some(reason), _) => RebuildStatus::Failed(reason),
                    (None, Error::Cancelled) => RebuildStatus::Cancelled,
                    (None, e) => RebuildStatus::Failed(e.to_string()),
                };
                tracing::warn!("Rebuild of replica {} ended: {:?}", target, status);

                // The target keeps its data in WriteOnly and stops taking live writes
                self.update_replica(target, |state| state.rebuilding = false)
                    .await;
                status
            }
        };
        session.finish(status);

        if self.replica_state(target).await.is_none() {
            self.forget_rebuild(target).await;
        }
    }

    /// Drop the finished session of a replica that left the volume
    pub(super) async fn forget_rebuild(&self, address: &str) {
        let mut rebuilds = self.rebuilds.write().await;
        if rebuilds.get(address).map(|s| !s.is_active()).unwrap_or(false) {
            rebuilds.remove(address);
        }
    }

    /// Progress of the latest rebuild of `address`
    pub async fn rebuild_info(&self, address: &str) -> Result<RebuildInfo> {
        self.rebuilds
            .read()
            .await
            .get(address)
            .map(|s| s.info())
            .ok_or_else(|| Error::NotFound(format!("No rebuild recorded for {}", address)))
    }

    /// Latest rebuild of every replica
    pub async fn rebuilds(&self) -> Vec<RebuildInfo> {
        let mut infos: Vec<RebuildInfo> =
            self.rebuilds.read().await.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.target.cmp(&b.target));
        infos
    }

    /// Cancel a running rebuild
    pub async fn cancel_rebuild(&self, address: &str) -> Result<()> {
        match self.rebuilds.read().await.get(address) {
            Some(session) if session.is_active() => {
                tracing::info!("Cancelling rebuild of {}", address);
                session.cancel();
                Ok(())
            }
            _ => Err(Error::NotFound(format!("No running rebuild for {}", address))),
        }
    }

    /// Wait for the latest rebuild of `address` to end
    pub async fn wait_for_rebuild(&self, address: &str) -> Result<RebuildInfo> {
        let session = self
            .rebuilds
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No rebuild recorded for {}", address)))?;

        let info = session.wait().await;
        match &info.status {
            RebuildStatus::Completed => Ok(info),
            RebuildStatus::Cancelled => Err(Error::Cancelled),
            RebuildStatus::Failed(reason) => Err(Error::Transfer(reason.clone())),
            other => Err(Error::Internal(format!("Rebuild ended in state {:?}", other))),
        }
    }

    /// Any rebuild still running
    pub async fn rebuild_active(&self) -> bool {
        self.rebuilds.read().await.values().any(|s| s.is_active())
    }

    pub(super) async fn abort_rebuilds_involving(&self, address: &str, reason: &str) {
        for session in self.rebuilds.read().await.values() {
            if session.is_active() && session.involves(address) {
                session.abort(format!("replica {} failed: {}", address, reason));
            }
        }
    }
}
