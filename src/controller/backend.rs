//! Replica Backends
//!
//! The controller's view of a replica, over TCP or in-process.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::chain::{LayerInfo, LayerView, PrepareRemoveAction};
use crate::error::{Error, Result};
use crate::network::{Message, NetworkClient};
use crate::replica::{Replica, ReplicaInfo};
use crate::state::ReplicaMode;
use crate::sync::{RemoteSink, RemoteSource, ReplicaSink, ReplicaSource, SyncSink, SyncSource};

/// Operations the controller issues to one replica
#[async_trait::async_trait]
pub trait ReplicaBackend: Send + Sync {
    /// Address the replica was attached with
    fn address(&self) -> &str;

    async fn info(&self) -> Result<ReplicaInfo>;

    async fn create(&self, size: u64, block_size: u32) -> Result<()>;

    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Apply a write, returning the revision it was stamped with
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u64>;

    async fn snapshot(&self, name: &str) -> Result<()>;

    async fn set_checkpoint(&self, name: &str) -> Result<()>;

    async fn revert(&self, name: &str) -> Result<()>;

    async fn resize(&self, size: u64) -> Result<()>;

    async fn prepare_remove_disk(&self, name: &str) -> Result<Vec<PrepareRemoveAction>>;

    async fn remove_disk(&self, name: &str) -> Result<()>;

    async fn set_mode(&self, mode: ReplicaMode) -> Result<()>;

    async fn replace_disk(&self, old: &str, staged: &str) -> Result<()>;

    /// Audited counter override
    async fn set_revision_counter(&self, value: u64) -> Result<()>;

    /// Audited mode override, bypassing the state machine
    async fn set_replica_mode(&self, mode: ReplicaMode) -> Result<()>;

    async fn set_logging(&self, level: &str) -> Result<()>;

    async fn prepare_rebuild(&self, layers: &[LayerInfo], size: u64, revision: u64) -> Result<()>;

    async fn finish_rebuild(&self, revision: u64) -> Result<()>;

    /// Transfer source reading one of this replica's layers
    fn source(&self, layer: &str, view: LayerView, compress: bool) -> Box<dyn SyncSource>;

    /// Transfer sink writing one of this replica's inactive layers
    fn sink(&self, layer: &str) -> Box<dyn SyncSink>;
}

/// Turns a replica address into a backend
#[async_trait::async_trait]
pub trait ReplicaConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ReplicaBackend>>;
}

/// Replica agent in this process
pub struct LocalReplica {
    address: String,
    replica: Arc<Replica>,
}

impl LocalReplica {
    pub fn new(address: String, replica: Arc<Replica>) -> Self {
        Self { address, replica }
    }
}

#[async_trait::async_trait]
impl ReplicaBackend for LocalReplica {
    fn address(&self) -> &str {
        &self.address
    }

    async fn info(&self) -> Result<ReplicaInfo> {
        self.replica.info().await
    }

    async fn create(&self, size: u64, block_size: u32) -> Result<()> {
        self.replica.create(size, block_size).await
    }

    async fn open(&self) -> Result<()> {
        self.replica.open().await
    }

    async fn close(&self) -> Result<()> {
        self.replica.close().await
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.replica.read_at(offset, len).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u64> {
        self.replica.write_at(offset, data).await
    }

    async fn snapshot(&self, name: &str) -> Result<()> {
        self.replica.snapshot(name).await
    }

    async fn set_checkpoint(&self, name: &str) -> Result<()> {
        self.replica.set_checkpoint(name).await
    }

    async fn revert(&self, name: &str) -> Result<()> {
        self.replica.revert(name).await
    }

    async fn resize(&self, size: u64) -> Result<()> {
        self.replica.resize(size).await
    }

    async fn prepare_remove_disk(&self, name: &str) -> Result<Vec<PrepareRemoveAction>> {
        self.replica.prepare_remove_disk(name).await
    }

    async fn remove_disk(&self, name: &str) -> Result<()> {
        self.replica.remove_disk(name).await
    }

    async fn set_mode(&self, mode: ReplicaMode) -> Result<()> {
        self.replica.set_mode(mode).await
    }

    async fn replace_disk(&self, old: &str, staged: &str) -> Result<()> {
        self.replica.replace_disk(old, staged).await
    }

    async fn set_revision_counter(&self, value: u64) -> Result<()> {
        self.replica.set_revision_counter(value).await
    }

    async fn set_replica_mode(&self, mode: ReplicaMode) -> Result<()> {
        self.replica.set_replica_mode(mode).await
    }

    async fn set_logging(&self, level: &str) -> Result<()> {
        self.replica.set_logging(level).await
    }

    async fn prepare_rebuild(&self, layers: &[LayerInfo], size: u64, revision: u64) -> Result<()> {
        self.replica.prepare_rebuild(layers, size, revision).await
    }

    async fn finish_rebuild(&self, revision: u64) -> Result<()> {
        self.replica.finish_rebuild(revision).await
    }

    fn source(&self, layer: &str, view: LayerView, _compress: bool) -> Box<dyn SyncSource> {
        Box::new(ReplicaSource::new(self.replica.clone(), layer.to_string(), view))
    }

    fn sink(&self, layer: &str) -> Box<dyn SyncSink> {
        Box::new(ReplicaSink::new(self.replica.clone(), layer.to_string()))
    }
}

/// Replica agent reached over TCP
pub struct RemoteReplica {
    address: String,
    client: Arc<NetworkClient>,
}

impl RemoteReplica {
    pub fn new(address: String, client: Arc<NetworkClient>) -> Self {
        Self { address, client }
    }

    async fn call(&self, request: Message) -> Result<Message> {
        self.client.send(&self.address, request).await
    }

    async fn expect_ok(&self, request: Message) -> Result<()> {
        match self.call(request).await? {
            Message::Ok => Ok(()),
            other => Err(self.unexpected(&other)),
        }
    }

    fn unexpected(&self, response: &Message) -> Error {
        Error::Network(format!(
            "Unexpected {} response from {}",
            response.type_name(),
            self.address
        ))
    }
}

#[async_trait::async_trait]
impl ReplicaBackend for RemoteReplica {
    fn address(&self) -> &str {
        &self.address
    }

    async fn info(&self) -> Result<ReplicaInfo> {
        match self.call(Message::GetInfo).await? {
            Message::Info(info) => Ok(info),
            other => Err(self.unexpected(&other)),
        }
    }

    async fn create(&self, size: u64, block_size: u32) -> Result<()> {
        self.expect_ok(Message::Create { size, block_size }).await
    }

    async fn open(&self) -> Result<()> {
        self.expect_ok(Message::Open).await
    }

    async fn close(&self) -> Result<()> {
        self.expect_ok(Message::Close).await
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let length = u32::try_from(len).map_err(|_| {
            Error::TooLarge(format!("read of {} bytes from {}", len, self.address))
        })?;
        let request = Message::Read { offset, length };
        match self.call(request).await? {
            Message::Data { data } => Ok(data),
            other => Err(self.unexpected(&other)),
        }
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u64> {
        let request = Message::Write {
            offset,
            data: data.to_vec(),
        };
        match self.call(request).await? {
            Message::WriteAck { revision } => Ok(revision),
            other => Err(self.unexpected(&other)),
        }
    }

    async fn snapshot(&self, name: &str) -> Result<()> {
        self.expect_ok(Message::Snapshot { name: name.to_string() }).await
    }

    async fn set_checkpoint(&self, name: &str) -> Result<()> {
        self.expect_ok(Message::SetCheckpoint { name: name.to_string() }).await
    }

    async fn revert(&self, name: &str) -> Result<()> {
        self.expect_ok(Message::Revert { name: name.to_string() }).await
    }

    async fn resize(&self, size: u64) -> Result<()> {
        self.expect_ok(Message::Resize { size }).await
    }

    async fn prepare_remove_disk(&self, name: &str) -> Result<Vec<PrepareRemoveAction>> {
        let request = Message::PrepareRemoveDisk { name: name.to_string() };
        match self.call(request).await? {
            Message::RemoveActions { actions } => Ok(actions),
            other => Err(self.unexpected(&other)),
        }
    }

    async fn remove_disk(&self, name: &str) -> Result<()> {
        self.expect_ok(Message::RemoveDisk { name: name.to_string() }).await
    }

    async fn set_mode(&self, mode: ReplicaMode) -> Result<()> {
        self.expect_ok(Message::SetMode { mode }).await
    }

    async fn replace_disk(&self, old: &str, staged: &str) -> Result<()> {
        self.expect_ok(Message::ReplaceDisk {
            old: old.to_string(),
            staged: staged.to_string(),
        })
        .await
    }

    async fn set_revision_counter(&self, value: u64) -> Result<()> {
        self.expect_ok(Message::SetRevisionCounter { value }).await
    }

    async fn set_replica_mode(&self, mode: ReplicaMode) -> Result<()> {
        self.expect_ok(Message::SetReplicaMode { mode }).await
    }

    async fn set_logging(&self, level: &str) -> Result<()> {
        self.expect_ok(Message::SetLogging { level: level.to_string() }).await
    }

    async fn prepare_rebuild(&self, layers: &[LayerInfo], size: u64, revision: u64) -> Result<()> {
        self.expect_ok(Message::PrepareRebuild {
            layers: layers.to_vec(),
            size,
            revision,
        })
        .await
    }

    async fn finish_rebuild(&self, revision: u64) -> Result<()> {
        self.expect_ok(Message::FinishRebuild { revision }).await
    }

    fn source(&self, layer: &str, view: LayerView, compress: bool) -> Box<dyn SyncSource> {
        Box::new(RemoteSource::new(
            self.client.clone(),
            self.address.clone(),
            layer.to_string(),
            view,
            compress,
        ))
    }

    fn sink(&self, layer: &str) -> Box<dyn SyncSink> {
        Box::new(RemoteSink::new(
            self.client.clone(),
            self.address.clone(),
            layer.to_string(),
        ))
    }
}

/// Connects to replica agents over TCP
pub struct RemoteConnector {
    client: Arc<NetworkClient>,
}

impl RemoteConnector {
    pub fn new(client: Arc<NetworkClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ReplicaConnector for RemoteConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ReplicaBackend>> {
        match self.client.send(address, Message::Ping).await? {
            Message::Pong => Ok(Arc::new(RemoteReplica::new(
                address.to_string(),
                self.client.clone(),
            ))),
            other => Err(Error::Network(format!(
                "Unexpected {} response to ping from {}",
                other.type_name(),
                address
            ))),
        }
    }
}

/// Resolves addresses to replica agents registered in this process
#[derive(Default)]
pub struct LocalConnector {
    replicas: RwLock<HashMap<String, Arc<Replica>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `replica` reachable under `address`
    pub async fn register(&self, address: &str, replica: Arc<Replica>) {
        self.replicas
            .write()
            .await
            .insert(address.to_string(), replica);
    }
}

#[async_trait::async_trait]
impl ReplicaConnector for LocalConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ReplicaBackend>> {
        let replicas = self.replicas.read().await;
        match replicas.get(address) {
            Some(replica) => Ok(Arc::new(LocalReplica::new(address.to_string(), replica.clone()))),
            None => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "no local replica registered".into(),
            }),
        }
    }
}
