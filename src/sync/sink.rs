//! Sync Sinks

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::source::unexpected;
use super::SyncSink;
use crate::chain::{block_digest, BlockChecksum, BlockRange, Layer};
use crate::error::{Error, Result};
use crate::network::{BlockPayload, Message, NetworkClient};
use crate::replica::Replica;

/// Inactive layer of an in-process replica under rebuild
pub struct ReplicaSink {
    replica: Arc<Replica>,
    layer: String,
}

impl ReplicaSink {
    pub fn new(replica: Arc<Replica>, layer: String) -> Self {
        Self { replica, layer }
    }
}

#[async_trait::async_trait]
impl SyncSink for ReplicaSink {
    fn describe(&self) -> String {
        format!("{}:{}", self.replica.dir().display(), self.layer)
    }

    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        self.replica
            .digests(&self.layer, crate::chain::LayerView::Own, range)
            .await
    }

    async fn write_blocks(&self, first: u64, payload: BlockPayload) -> Result<()> {
        let data = payload.decode()?;
        self.replica.apply_range(&self.layer, first, &data).await
    }

    async fn trim_blocks(&self, range: BlockRange) -> Result<()> {
        self.replica.trim_range(&self.layer, range).await
    }

    async fn finish(&self) -> Result<()> {
        self.replica.flush_layer(&self.layer).await
    }
}

/// Inactive layer of a replica reached over TCP
pub struct RemoteSink {
    client: Arc<NetworkClient>,
    address: String,
    layer: String,
}

impl RemoteSink {
    pub fn new(client: Arc<NetworkClient>, address: String, layer: String) -> Self {
        Self { client, address, layer }
    }

    async fn expect_ok(&self, request: Message) -> Result<()> {
        match self.client.send(&self.address, request).await? {
            Message::Ok => Ok(()),
            other => Err(unexpected(&self.address, &other)),
        }
    }
}

#[async_trait::async_trait]
impl SyncSink for RemoteSink {
    fn describe(&self) -> String {
        format!("{}:{}", self.address, self.layer)
    }

    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        let request = Message::Digests {
            layer: self.layer.clone(),
            view: crate::chain::LayerView::Own,
            range,
        };
        match self.client.send(&self.address, request).await? {
            Message::DigestList { checksums } => Ok(checksums),
            other => Err(unexpected(&self.address, &other)),
        }
    }

    async fn write_blocks(&self, first: u64, payload: BlockPayload) -> Result<()> {
        self.expect_ok(Message::ApplyRange {
            layer: self.layer.clone(),
            first,
            payload,
        })
        .await
    }

    async fn trim_blocks(&self, range: BlockRange) -> Result<()> {
        self.expect_ok(Message::TrimRange {
            layer: self.layer.clone(),
            range,
        })
        .await
    }

    async fn finish(&self) -> Result<()> {
        self.expect_ok(Message::FlushLayer {
            layer: self.layer.clone(),
        })
        .await
    }
}

/// Standalone layer file, staged for `replace_disk`
pub struct LayerFileSink {
    path: PathBuf,
    layer: Mutex<Layer>,
}

impl LayerFileSink {
    /// Resume into an existing staged file or start a new one
    pub fn open_or_create(path: PathBuf, block_size: u32) -> Result<Self> {
        let layer = if path.exists() {
            let layer = Layer::open(path.clone(), true)?;
            if layer.block_size() != block_size {
                return Err(Error::Transfer(format!(
                    "Staged file {:?} has block size {}, source uses {}",
                    path,
                    layer.block_size(),
                    block_size
                )));
            }
            layer
        } else {
            Layer::create(path.clone(), block_size, false)?
        };

        Ok(Self {
            path,
            layer: Mutex::new(layer),
        })
    }
}

#[async_trait::async_trait]
impl SyncSink for LayerFileSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        let layer = self.layer.lock().await;
        let mut checksums = Vec::new();
        for block in layer.allocated_in(range.first, range.count as u64) {
            if let Some(data) = layer.read_block(block)? {
                checksums.push(BlockChecksum { block, digest: block_digest(&data) });
            }
        }
        Ok(checksums)
    }

    async fn write_blocks(&self, first: u64, payload: BlockPayload) -> Result<()> {
        let data = payload.decode()?;
        self.layer.lock().await.append_blocks(0, first, &data)
    }

    async fn trim_blocks(&self, range: BlockRange) -> Result<()> {
        self.layer.lock().await.trim_blocks(range.first, range.count)
    }

    async fn finish(&self) -> Result<()> {
        self.layer.lock().await.sync()
    }
}

/// Flat image file; all-zero blocks count as unallocated
pub struct ImageSink {
    path: PathBuf,
    file: File,
    size: u64,
    block_size: u32,
}

impl ImageSink {
    /// Open or create an image of `size` bytes
    pub fn open(path: PathBuf, size: u64, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() != size {
            file.set_len(size)?;
        }

        Ok(Self {
            path,
            file,
            size,
            block_size,
        })
    }

    fn block_offset(&self, block: u64, len: usize) -> Result<u64> {
        let offset = block * self.block_size as u64;
        if offset + len as u64 > self.size {
            return Err(Error::Transfer(format!(
                "Block {} is beyond image size {}",
                block, self.size
            )));
        }
        Ok(offset)
    }
}

#[async_trait::async_trait]
impl SyncSink for ImageSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        let bs = self.block_size as u64;
        let mut buf = vec![0u8; self.block_size as usize];
        let mut checksums = Vec::new();

        for block in range.first..range.end().min(self.size / bs) {
            self.file.read_exact_at(&mut buf, block * bs)?;
            if buf.iter().any(|b| *b != 0) {
                checksums.push(BlockChecksum { block, digest: block_digest(&buf) });
            }
        }
        Ok(checksums)
    }

    async fn write_blocks(&self, first: u64, payload: BlockPayload) -> Result<()> {
        let data = payload.decode()?;
        let offset = self.block_offset(first, data.len())?;
        self.file.write_all_at(&data, offset)?;
        Ok(())
    }

    async fn trim_blocks(&self, range: BlockRange) -> Result<()> {
        let zeros = vec![0u8; range.count as usize * self.block_size as usize];
        let offset = self.block_offset(range.first, zeros.len())?;
        self.file.write_all_at(&zeros, offset)?;
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
