//! Replica Protocol
//!
//! Defines the wire protocol between the controller, the sync agent and
//! replica agents. Every request gets exactly one response.

use serde::{Deserialize, Serialize};

use crate::chain::{BlockChecksum, BlockRange, LayerInfo, LayerView, PrepareRemoveAction};
use crate::error::{Error, ErrorCode, Result};
use crate::replica::ReplicaInfo;
use crate::state::ReplicaMode;

/// Block data, optionally LZ4-compressed on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPayload {
    pub data: Vec<u8>,
    pub compressed: bool,
}

impl BlockPayload {
    /// Wrap block data, compressing when asked to
    pub fn encode(data: Vec<u8>, compress: bool) -> Self {
        if compress {
            Self {
                data: lz4_flex::compress_prepend_size(&data),
                compressed: true,
            }
        } else {
            Self { data, compressed: false }
        }
    }

    /// Recover the raw block data
    pub fn decode(self) -> Result<Vec<u8>> {
        if self.compressed {
            lz4_flex::decompress_size_prepended(&self.data)
                .map_err(|e| Error::Transfer(format!("Block payload decompression failed: {}", e)))
        } else {
            Ok(self.data)
        }
    }

    /// Size on the wire
    pub fn wire_len(&self) -> usize {
        self.data.len()
    }
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Lifecycle ==========
    Ping,

    /// Initialize a fresh chain
    Create { size: u64, block_size: u32 },

    Open,

    Close,

    GetInfo,

    // ========== Block I/O ==========
    Read { offset: u64, length: u32 },

    Write { offset: u64, data: Vec<u8> },

    // ========== Chain ==========
    Snapshot { name: String },

    SetCheckpoint { name: String },

    Revert { name: String },

    Resize { size: u64 },

    PrepareRemoveDisk { name: String },

    RemoveDisk { name: String },

    ReplaceDisk { old: String, staged: String },

    // ========== Administration ==========
    /// Audited counter override
    SetRevisionCounter { value: u64 },

    /// Audited mode override
    SetReplicaMode { mode: ReplicaMode },

    /// Mode change through the state machine
    SetMode { mode: ReplicaMode },

    SetLogging { level: String },

    // ========== Rebuild ==========
    PrepareRebuild {
        layers: Vec<LayerInfo>,
        size: u64,
        revision: u64,
    },

    FinishRebuild { revision: u64 },

    /// Digests of the allocated blocks of a layer within one range
    Digests {
        layer: String,
        view: LayerView,
        range: BlockRange,
    },

    ReadRange {
        layer: String,
        range: BlockRange,
        view: LayerView,
        compress: bool,
    },

    ApplyRange {
        layer: String,
        first: u64,
        payload: BlockPayload,
    },

    TrimRange { layer: String, range: BlockRange },

    FlushLayer { layer: String },

    // ========== Responses ==========
    Ok,

    Pong,

    Info(ReplicaInfo),

    Data { data: Vec<u8> },

    WriteAck { revision: u64 },

    RemoveActions { actions: Vec<PrepareRemoveAction> },

    DigestList { checksums: Vec<BlockChecksum> },

    Blocks { payload: BlockPayload },

    /// Typed error response
    Error { code: ErrorCode, message: String },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Error response for a failed request
    pub fn error(err: &Error) -> Self {
        Message::Error {
            code: err.code(),
            message: err.detail(),
        }
    }

    /// Turn an error response back into a typed error
    pub fn into_result(self, replica: &str) -> Result<Message> {
        match self {
            Message::Error { code, message } => Err(Error::from_wire(code, message, replica)),
            other => Ok(other),
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Ping => "Ping",
            Message::Create { .. } => "Create",
            Message::Open => "Open",
            Message::Close => "Close",
            Message::GetInfo => "GetInfo",
            Message::Read { .. } => "Read",
            Message::Write { .. } => "Write",
            Message::Snapshot { .. } => "Snapshot",
            Message::SetCheckpoint { .. } => "SetCheckpoint",
            Message::Revert { .. } => "Revert",
            Message::Resize { .. } => "Resize",
            Message::PrepareRemoveDisk { .. } => "PrepareRemoveDisk",
            Message::RemoveDisk { .. } => "RemoveDisk",
            Message::ReplaceDisk { .. } => "ReplaceDisk",
            Message::SetRevisionCounter { .. } => "SetRevisionCounter",
            Message::SetReplicaMode { .. } => "SetReplicaMode",
            Message::SetMode { .. } => "SetMode",
            Message::SetLogging { .. } => "SetLogging",
            Message::PrepareRebuild { .. } => "PrepareRebuild",
            Message::FinishRebuild { .. } => "FinishRebuild",
            Message::Digests { .. } => "Digests",
            Message::ReadRange { .. } => "ReadRange",
            Message::ApplyRange { .. } => "ApplyRange",
            Message::TrimRange { .. } => "TrimRange",
            Message::FlushLayer { .. } => "FlushLayer",
            Message::Ok => "Ok",
            Message::Pong => "Pong",
            Message::Info(_) => "Info",
            Message::Data { .. } => "Data",
            Message::WriteAck { .. } => "WriteAck",
            Message::RemoveActions { .. } => "RemoveActions",
            Message::DigestList { .. } => "DigestList",
            Message::Blocks { .. } => "Blocks",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for wire protocol
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted frame body
    pub const MAX_LENGTH: u32 = 256 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_keeps_kind() {
        let msg = Message::error(&Error::ChainBusy("rebuild in progress".into()));
        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored.into_result("r1") {
            Err(Error::ChainBusy(message)) => assert_eq!(message, "rebuild in progress"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_payload_compression() {
        let data = vec![7u8; 4096];
        let payload = BlockPayload::encode(data.clone(), true);
        assert!(payload.wire_len() < data.len());
        assert_eq!(payload.decode().unwrap(), data);
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
