//! Replica Server
//!
//! Exposes a replica agent over the framed TCP protocol.

use std::sync::Arc;

use super::Replica;
use crate::error::{Error, Result};
use crate::network::{BlockPayload, Message, NetworkServer, RequestHandler};

/// Request dispatcher for one replica
pub struct ReplicaServer {
    replica: Arc<Replica>,
}

impl ReplicaServer {
    pub fn new(replica: Arc<Replica>) -> Self {
        Self { replica }
    }

    /// Build a network server bound to `bind_address` for this replica
    pub fn into_network(self, bind_address: String) -> NetworkServer {
        NetworkServer::new(bind_address, Arc::new(self))
    }

    async fn dispatch(&self, message: Message) -> Result<Message> {
        let replica = &self.replica;
        let kind = message.type_name();
        let response = match message {
            Message::Ping => Message::Pong,
            Message::Create { size, block_size } => {
                replica.create(size, block_size).await?;
                Message::Ok
            }
            Message::Open => {
                replica.open().await?;
                Message::Ok
            }
            Message::Close => {
                replica.close().await?;
                Message::Ok
            }
            Message::GetInfo => Message::Info(replica.info().await?),
            Message::Read { offset, length } => Message::Data {
                data: replica.read_at(offset, length as usize).await?,
            },
            Message::Write { offset, data } => Message::WriteAck {
                revision: replica.write_at(offset, &data).await?,
            },
            Message::Snapshot { name } => {
                replica.snapshot(&name).await?;
                Message::Ok
            }
            Message::SetCheckpoint { name } => {
                replica.set_checkpoint(&name).await?;
                Message::Ok
            }
            Message::Revert { name } => {
                replica.revert(&name).await?;
                Message::Ok
            }
            Message::Resize { size } => {
                replica.resize(size).await?;
                Message::Ok
            }
            Message::PrepareRemoveDisk { name } => Message::RemoveActions {
                actions: replica.prepare_remove_disk(&name).await?,
            },
            Message::RemoveDisk { name } => {
                replica.remove_disk(&name).await?;
                Message::Ok
            }
            Message::ReplaceDisk { old, staged } => {
                replica.replace_disk(&old, &staged).await?;
                Message::Ok
            }
            Message::SetRevisionCounter { value } => {
                replica.set_revision_counter(value).await?;
                Message::Ok
            }
            Message::SetReplicaMode { mode } => {
                replica.set_replica_mode(mode).await?;
                Message::Ok
            }
            Message::SetMode { mode } => {
                replica.set_mode(mode).await?;
                Message::Ok
            }
            Message::SetLogging { level } => {
                replica.set_logging(&level).await?;
                Message::Ok
            }
            Message::PrepareRebuild { layers, size, revision } => {
                replica.prepare_rebuild(&layers, size, revision).await?;
                Message::Ok
            }
            Message::FinishRebuild { revision } => {
                replica.finish_rebuild(revision).await?;
                Message::Ok
            }
            Message::Digests { layer, view, range } => Message::DigestList {
                checksums: replica.digests(&layer, view, range).await?,
            },
            Message::ReadRange { layer, range, view, compress } => {
                let data = replica.read_range(&layer, range, view).await?;
                Message::Blocks {
                    payload: BlockPayload::encode(data, compress),
                }
            }
            Message::ApplyRange { layer, first, payload } => {
                let data = payload.decode()?;
                replica.apply_range(&layer, first, &data).await?;
                Message::Ok
            }
            Message::TrimRange { layer, range } => {
                replica.trim_range(&layer, range).await?;
                Message::Ok
            }
            Message::FlushLayer { layer } => {
                replica.flush_layer(&layer).await?;
                Message::Ok
            }
            Message::Ok
            | Message::Pong
            | Message::Info(_)
            | Message::Data { .. }
            | Message::WriteAck { .. }
            | Message::RemoveActions { .. }
            | Message::DigestList { .. }
            | Message::Blocks { .. }
            | Message::Error { .. } => {
                return Err(Error::InvalidState(format!("{} is not a request", kind)));
            }
        };
        Ok(response)
    }
}

#[async_trait::async_trait]
impl RequestHandler for ReplicaServer {
    async fn handle(&self, peer: &str, message: Message) -> Message {
        let kind = message.type_name();
        match self.dispatch(message).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_rejection() {
                    tracing::debug!("{} from {} rejected: {}", kind, peer, e);
                } else {
                    tracing::warn!("{} from {} failed: {}", kind, peer, e);
                }
                Message::error(&e)
            }
        }
    }
}
