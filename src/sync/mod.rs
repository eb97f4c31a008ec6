//! Sync Agent Module
//!
//! Differential block transfer between a source layer and a sink. Both
//! sides report per-block SHA-256 digests; only blocks whose digests differ
//! move, grouped into contiguous ranges, and blocks present only on the
//! sink are trimmed. Digests are exchanged one window of blocks at a time. Used by replica rebuilds, by the `sync-agent`
//! command to stage repaired layers, and by backup export.

mod agent;
mod sink;
mod source;

pub use agent::{RangeDone, SyncAgent, SyncReport};
pub use sink::{ImageSink, LayerFileSink, RemoteSink, ReplicaSink};
pub use source::{RemoteSource, ReplicaSource};

use crate::chain::{BlockChecksum, BlockRange};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::network::BlockPayload;

/// Transfer tuning
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Maximum blocks per transferred range
    pub batch_blocks: usize,
    /// Ask remote sources for LZ4-compressed payloads
    pub compression: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_blocks: config.batch_blocks.max(1),
            compression: config.compression,
        }
    }
}

/// Side a transfer reads from
#[async_trait::async_trait]
pub trait SyncSource: Send + Sync {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Digests of the allocated blocks within `range`
    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>>;

    /// Read a range of allocated blocks
    async fn read_blocks(&self, range: BlockRange) -> Result<BlockPayload>;
}

/// Side a transfer writes to
#[async_trait::async_trait]
pub trait SyncSink: Send + Sync {
    fn describe(&self) -> String;

    /// Digests of the blocks the sink currently holds within `range`
    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>>;

    /// Store a contiguous run of blocks starting at `first`
    async fn write_blocks(&self, first: u64, payload: BlockPayload) -> Result<()>;

    /// Drop blocks the source does not hold
    async fn trim_blocks(&self, range: BlockRange) -> Result<()>;

    /// Make everything written durable
    async fn finish(&self) -> Result<()>;
}
