//! Sync Sources

use std::sync::Arc;

use super::SyncSource;
use crate::chain::{BlockChecksum, BlockRange, LayerView};
use crate::error::{Error, Result};
use crate::network::{BlockPayload, Message, NetworkClient};
use crate::replica::Replica;

/// Layer of an in-process replica
pub struct ReplicaSource {
    replica: Arc<Replica>,
    layer: String,
    view: LayerView,
}

impl ReplicaSource {
    pub fn new(replica: Arc<Replica>, layer: String, view: LayerView) -> Self {
        Self { replica, layer, view }
    }
}

#[async_trait::async_trait]
impl SyncSource for ReplicaSource {
    fn describe(&self) -> String {
        format!("{}:{}", self.replica.dir().display(), self.layer)
    }

    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        self.replica.digests(&self.layer, self.view, range).await
    }

    async fn read_blocks(&self, range: BlockRange) -> Result<BlockPayload> {
        let data = self.replica.read_range(&self.layer, range, self.view).await?;
        Ok(BlockPayload::encode(data, false))
    }
}

/// Layer of a replica reached over TCP
pub struct RemoteSource {
    client: Arc<NetworkClient>,
    address: String,
    layer: String,
    view: LayerView,
    compress: bool,
}

impl RemoteSource {
    pub fn new(
        client: Arc<NetworkClient>,
        address: String,
        layer: String,
        view: LayerView,
        compress: bool,
    ) -> Self {
        Self {
            client,
            address,
            layer,
            view,
            compress,
        }
    }
}

#[async_trait::async_trait]
impl SyncSource for RemoteSource {
    fn describe(&self) -> String {
        format!("{}:{}", self.address, self.layer)
    }

    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        let request = Message::Digests {
            layer: self.layer.clone(),
            view: self.view,
            range,
        };
        match self.client.send(&self.address, request).await? {
            Message::DigestList { checksums } => Ok(checksums),
            other => Err(unexpected(&self.address, &other)),
        }
    }

    async fn read_blocks(&self, range: BlockRange) -> Result<BlockPayload> {
        let request = Message::ReadRange {
            layer: self.layer.clone(),
            range,
            view: self.view,
            compress: self.compress,
        };
        match self.client.send(&self.address, request).await? {
            Message::Blocks { payload } => Ok(payload),
            other => Err(unexpected(&self.address, &other)),
        }
    }
}

pub(crate) fn unexpected(address: &str, response: &Message) -> Error {
    Error::Network(format!(
        "Unexpected {} response from {}",
        response.type_name(),
        address
    ))
}
