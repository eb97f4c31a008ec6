//! Snapshot Chain Module
//!
//! Durable copy-on-write representation of a replica's data: an ordered
//! chain of layer files from the base up to the writable head, linked by
//! the replica catalog.

mod layer;
mod store;

pub use layer::{Layer, LayerHeader, HEADER_SIZE};
pub use store::{ChainOptions, ChainStore};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::path::PathBuf;

/// Name of the writable head layer
pub const HEAD_NAME: &str = "volume-head";

/// Prefix of layer files managed by the catalog
const DISK_FILE_PREFIX: &str = "disk-";

/// SHA-256 digest of one block
pub type BlockDigest = [u8; 32];

/// Compute the digest of a block
pub fn block_digest(data: &[u8]) -> BlockDigest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest of one allocated block in a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChecksum {
    pub block: u64,
    pub digest: BlockDigest,
}

/// Contiguous run of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub first: u64,
    pub count: u32,
}

impl BlockRange {
    pub fn new(first: u64, count: u32) -> Self {
        Self { first, count }
    }

    /// One past the last block
    pub fn end(&self) -> u64 {
        self.first + self.count as u64
    }

    /// Split `[0, blocks)` into consecutive windows of at most `window` blocks
    pub fn windows(blocks: u64, window: u32) -> impl Iterator<Item = BlockRange> {
        let window = window.max(1);
        (0..blocks)
            .step_by(window as usize)
            .map(move |first| BlockRange::new(first, (blocks - first).min(window as u64) as u32))
    }

    /// Group ascending block numbers into contiguous ranges of at most `max_len` blocks
    pub fn coalesce(blocks: impl IntoIterator<Item = u64>, max_len: usize) -> Vec<BlockRange> {
        let max_len = max_len.max(1) as u32;
        let mut ranges: Vec<BlockRange> = Vec::new();
        for block in blocks {
            match ranges.last_mut() {
                Some(last) if last.end() == block && last.count < max_len => last.count += 1,
                _ => ranges.push(BlockRange::new(block, 1)),
            }
        }
        ranges
    }
}

/// Description of one chain layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Layer name (`volume-head` for the head)
    pub name: String,
    /// Parent layer name, `None` for the base
    pub parent: Option<String>,
    /// Revision counter when the layer was frozen
    pub created_revision: u64,
    /// Current checkpoint marker
    pub checkpoint: bool,
    /// Whether this is the writable head
    pub head: bool,
    /// Number of allocated blocks in this layer alone
    pub allocated_blocks: u64,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Which content of a layer a sync source serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerView {
    /// Blocks stored in the layer file itself
    Own,
    /// Content visible through the chain at that layer
    Flattened,
}

/// Step planned by `prepare_remove_disk`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareRemoveAction {
    /// Fold the blocks of `from` into `into`
    Coalesce { from: String, into: String },
    /// Unlink and delete the layer
    Remove { name: String },
}

/// Replica directory structure
#[derive(Debug, Clone)]
pub struct ChainPaths {
    pub base_dir: PathBuf,
}

impl ChainPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Path of a layer file by file name
    pub fn disk_path(&self, file: &str) -> PathBuf {
        self.base_dir.join(file)
    }

    /// Generate a fresh catalog-managed layer file name
    pub fn new_disk_file() -> String {
        format!("{}{}.img", DISK_FILE_PREFIX, uuid::Uuid::new_v4())
    }

    /// Check whether a file name belongs to the catalog namespace
    pub fn is_disk_file(file: &str) -> bool {
        file.starts_with(DISK_FILE_PREFIX) && file.ends_with(".img")
    }

    /// Ensure the replica directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }

    /// Flush directory entries after creating, renaming or deleting files
    pub fn sync_dir(&self) -> std::io::Result<()> {
        std::fs::File::open(&self.base_dir)?.sync_all()
    }
}
