//! Backup Export
//!
//! Flattens the chain-visible content of a snapshot into a flat image file.
//! Exporting again into the same image only moves the blocks that changed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::chain::{LayerInfo, LayerView};
use crate::error::{Error, Result};
use crate::network::{Message, NetworkClient};
use crate::replica::{Replica, ReplicaInfo};
use crate::sync::{ImageSink, RemoteSource, ReplicaSource, SyncAgent, SyncOptions, SyncReport, SyncSource};

/// Description written next to every exported image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Snapshot the image was flattened from
    pub snapshot: String,
    /// Replica the blocks were read from
    pub source: String,
    pub size: u64,
    pub block_size: u32,
    /// Revision counter when the snapshot was taken
    pub revision: u64,
    /// SHA-256 of the whole image, hex encoded
    pub sha256: String,
    pub report: SyncReport,
    pub exported_at: chrono::DateTime<chrono::Utc>,
}

impl BackupManifest {
    /// Load a manifest from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Internal(format!("Invalid backup manifest {:?}: {}", path, e)))
    }

    fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("Failed to encode backup manifest: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Manifest path for an image
pub fn manifest_path(image: &Path) -> PathBuf {
    let mut path = image.as_os_str().to_owned();
    path.push(".manifest.json");
    PathBuf::from(path)
}

fn image_digest(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn frozen_layer(info: &ReplicaInfo, snapshot: &str) -> Result<LayerInfo> {
    match info.layers.iter().find(|l| l.name == snapshot) {
        Some(layer) if layer.head => Err(Error::InvalidState(format!(
            "{} is the live head; take a snapshot to export it",
            snapshot
        ))),
        Some(layer) => Ok(layer.clone()),
        None => Err(Error::NotFound(format!("Snapshot {} is not in the chain", snapshot))),
    }
}

/// Exports snapshots into flat images
#[derive(Debug, Clone, Default)]
pub struct BackupExporter {
    agent: SyncAgent,
}

impl BackupExporter {
    pub fn new(options: SyncOptions) -> Self {
        Self {
            agent: SyncAgent::new(options),
        }
    }

    /// Export `snapshot` of a replica reached over TCP
    pub async fn export_remote(
        &self,
        client: Arc<NetworkClient>,
        address: &str,
        snapshot: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<BackupManifest> {
        let info = match client.send(address, Message::GetInfo).await? {
            Message::Info(info) => info,
            other => {
                return Err(Error::Network(format!(
                    "Unexpected {} response from {}",
                    other.type_name(),
                    address
                )))
            }
        };
        let layer = frozen_layer(&info, snapshot)?;
        let source = RemoteSource::new(
            client,
            address.to_string(),
            snapshot.to_string(),
            LayerView::Flattened,
            self.agent.options().compression,
        );
        self.export(&source, address, &info, &layer, output, cancel).await
    }

    /// Export `snapshot` of a replica in this process
    pub async fn export_local(
        &self,
        replica: Arc<Replica>,
        snapshot: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<BackupManifest> {
        let info = replica.info().await?;
        let layer = frozen_layer(&info, snapshot)?;
        let origin = replica.dir().display().to_string();
        let source = ReplicaSource::new(replica, snapshot.to_string(), LayerView::Flattened);
        self.export(&source, &origin, &info, &layer, output, cancel).await
    }

    async fn export(
        &self,
        source: &dyn SyncSource,
        origin: &str,
        info: &ReplicaInfo,
        layer: &LayerInfo,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<BackupManifest> {
        let sink = ImageSink::open(output.to_path_buf(), info.size, info.block_size)?;
        let report = self
            .agent
            .transfer(source, &sink, info.size / info.block_size as u64, cancel, &|done| {
                tracing::debug!("Backup range {}/{} done", done.completed, done.total);
            })
            .await?;

        let manifest = BackupManifest {
            snapshot: layer.name.clone(),
            source: origin.to_string(),
            size: info.size,
            block_size: info.block_size,
            revision: layer.created_revision,
            sha256: image_digest(output)?,
            report,
            exported_at: chrono::Utc::now(),
        };
        manifest.save(&manifest_path(output))?;

        tracing::info!(
            "Exported snapshot {} to {:?}: {} blocks copied, {} unchanged",
            manifest.snapshot,
            output,
            manifest.report.blocks_transferred,
            manifest.report.blocks_skipped
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainOptions;
    use tempfile::tempdir;

    const BS: u32 = 512;

    #[tokio::test]
    async fn test_export_flattens_and_reexports_incrementally() {
        let dir = tempdir().unwrap();
        let out = tempdir().unwrap();
        let replica = Arc::new(Replica::new(dir.path().join("r"), ChainOptions { fsync: false }));
        replica.create(16 * BS as u64, BS).await.unwrap();

        replica.write_at(0, &[1u8; 512]).await.unwrap();
        replica.snapshot("s1").await.unwrap();
        replica.write_at(1024, &[2u8; 512]).await.unwrap();
        replica.snapshot("s2").await.unwrap();

        let image = out.path().join("vol.img");
        let exporter = BackupExporter::default();
        let cancel = CancellationToken::new();

        let first = exporter
            .export_local(replica.clone(), "s2", &image, &cancel)
            .await
            .unwrap();
        assert_eq!(first.report.blocks_transferred, 2);
        assert_eq!(first.revision, 2);

        let data = std::fs::read(&image).unwrap();
        assert_eq!(data.len(), 16 * 512);
        assert_eq!(&data[..512], &[1u8; 512][..]);
        assert_eq!(&data[1024..1536], &[2u8; 512][..]);

        replica.write_at(1024, &[3u8; 512]).await.unwrap();
        replica.snapshot("s3").await.unwrap();
        let second = exporter
            .export_local(replica.clone(), "s3", &image, &cancel)
            .await
            .unwrap();
        assert_eq!(second.report.blocks_transferred, 1);
        assert_eq!(second.report.blocks_skipped, 1);

        let manifest = BackupManifest::load(&manifest_path(&image)).unwrap();
        assert_eq!(manifest.snapshot, "s3");
        assert_eq!(manifest.sha256.len(), 64);
    }

    #[tokio::test]
    async fn test_export_rejects_head_and_unknown() {
        let dir = tempdir().unwrap();
        let replica = Arc::new(Replica::new(dir.path().join("r"), ChainOptions { fsync: false }));
        replica.create(16 * BS as u64, BS).await.unwrap();
        let image = dir.path().join("vol.img");
        let exporter = BackupExporter::default();
        let cancel = CancellationToken::new();

        assert!(matches!(
            exporter.export_local(replica.clone(), crate::chain::HEAD_NAME, &image, &cancel).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            exporter.export_local(replica, "nope", &image, &cancel).await,
            Err(Error::NotFound(_))
        ));
    }
}
