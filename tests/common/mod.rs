//! Test harness for volume integration tests.
//!
//! Builds controllers over in-process replicas. Every replica sits behind a
//! `FaultyReplica` so tests can make it fail writes, reads or rebuild
//! transfers on demand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::sync::RwLock;

use wolfblock::chain::{BlockChecksum, BlockRange, ChainOptions, LayerInfo, LayerView, PrepareRemoveAction};
use wolfblock::controller::{Controller, ControllerOptions, LocalReplica, ReplicaBackend, ReplicaConnector};
use wolfblock::network::BlockPayload;
use wolfblock::replica::{Replica, ReplicaInfo};
use wolfblock::state::ReplicaMode;
use wolfblock::sync::SyncSink;
use wolfblock::{Error, Result};

pub const BS: u32 = 512;
pub const BLOCKS: u64 = 64;
pub const SIZE: u64 = BLOCKS * BS as u64;

/// Switches flipped by tests
#[derive(Default)]
pub struct Faults {
    pub fail_writes: AtomicBool,
    pub fail_reads: AtomicBool,
    pub fail_sink: AtomicBool,
    /// Writes fail on the controller side as if the request could not be encoded
    pub refuse_writes: AtomicBool,
    pub write_delay_ms: AtomicU64,
    pub sink_delay_ms: AtomicU64,
}

impl Faults {
    pub fn clear(&self) {
        self.fail_writes.store(false, Ordering::SeqCst);
        self.fail_reads.store(false, Ordering::SeqCst);
        self.fail_sink.store(false, Ordering::SeqCst);
        self.refuse_writes.store(false, Ordering::SeqCst);
        self.write_delay_ms.store(0, Ordering::SeqCst);
        self.sink_delay_ms.store(0, Ordering::SeqCst);
    }
}

fn injected(address: &str, what: &str) -> Error {
    Error::WriteFailed {
        replica: address.to_string(),
        reason: format!("injected {} fault", what),
    }
}

/// In-process replica with fault injection
pub struct FaultyReplica {
    inner: LocalReplica,
    address: String,
    faults: Arc<Faults>,
}

#[async_trait::async_trait]
impl ReplicaBackend for FaultyReplica {
    fn address(&self) -> &str {
        &self.address
    }

    async fn info(&self) -> Result<ReplicaInfo> {
        self.inner.info().await
    }

    async fn create(&self, size: u64, block_size: u32) -> Result<()> {
        self.inner.create(size, block_size).await
    }

    async fn open(&self) -> Result<()> {
        self.inner.open().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(injected(&self.address, "read"));
        }
        self.inner.read_at(offset, len).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u64> {
        let delay = self.faults.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.faults.refuse_writes.load(Ordering::SeqCst) {
            return Err(Error::TooLarge(format!("write of {} bytes", data.len())));
        }
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(injected(&self.address, "write"));
        }
        self.inner.write_at(offset, data).await
    }

    async fn snapshot(&self, name: &str) -> Result<()> {
        self.inner.snapshot(name).await
    }

    async fn set_checkpoint(&self, name: &str) -> Result<()> {
        self.inner.set_checkpoint(name).await
    }

    async fn revert(&self, name: &str) -> Result<()> {
        self.inner.revert(name).await
    }

    async fn resize(&self, size: u64) -> Result<()> {
        self.inner.resize(size).await
    }

    async fn prepare_remove_disk(&self, name: &str) -> Result<Vec<PrepareRemoveAction>> {
        self.inner.prepare_remove_disk(name).await
    }

    async fn remove_disk(&self, name: &str) -> Result<()> {
        self.inner.remove_disk(name).await
    }

    async fn set_mode(&self, mode: ReplicaMode) -> Result<()> {
        self.inner.set_mode(mode).await
    }

    async fn replace_disk(&self, old: &str, staged: &str) -> Result<()> {
        self.inner.replace_disk(old, staged).await
    }

    async fn set_revision_counter(&self, value: u64) -> Result<()> {
        self.inner.set_revision_counter(value).await
    }

    async fn set_replica_mode(&self, mode: ReplicaMode) -> Result<()> {
        self.inner.set_replica_mode(mode).await
    }

    async fn set_logging(&self, level: &str) -> Result<()> {
        self.inner.set_logging(level).await
    }

    async fn prepare_rebuild(&self, layers: &[LayerInfo], size: u64, revision: u64) -> Result<()> {
        self.inner.prepare_rebuild(layers, size, revision).await
    }

    async fn finish_rebuild(&self, revision: u64) -> Result<()> {
        self.inner.finish_rebuild(revision).await
    }

    fn source(&self, layer: &str, view: LayerView, compress: bool) -> Box<dyn wolfblock::sync::SyncSource> {
        self.inner.source(layer, view, compress)
    }

    fn sink(&self, layer: &str) -> Box<dyn SyncSink> {
        Box::new(FaultySink {
            inner: self.inner.sink(layer),
            address: self.address.clone(),
            faults: self.faults.clone(),
        })
    }
}

struct FaultySink {
    inner: Box<dyn SyncSink>,
    address: String,
    faults: Arc<Faults>,
}

#[async_trait::async_trait]
impl SyncSink for FaultySink {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        self.inner.digests(range).await
    }

    async fn write_blocks(&self, first: u64, payload: BlockPayload) -> Result<()> {
        let delay = self.faults.sink_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.faults.fail_sink.load(Ordering::SeqCst) {
            return Err(injected(&self.address, "sink"));
        }
        self.inner.write_blocks(first, payload).await
    }

    async fn trim_blocks(&self, range: BlockRange) -> Result<()> {
        self.inner.trim_blocks(range).await
    }

    async fn finish(&self) -> Result<()> {
        self.inner.finish().await
    }
}

/// Resolves test addresses to fault-injecting replicas
#[derive(Default)]
pub struct FaultyConnector {
    replicas: RwLock<HashMap<String, (Arc<Replica>, Arc<Faults>)>>,
}

impl FaultyConnector {
    pub async fn register(&self, address: &str, replica: Arc<Replica>) -> Arc<Faults> {
        let faults = Arc::new(Faults::default());
        self.replicas
            .write()
            .await
            .insert(address.to_string(), (replica, faults.clone()));
        faults
    }
}

#[async_trait::async_trait]
impl ReplicaConnector for FaultyConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ReplicaBackend>> {
        match self.replicas.read().await.get(address) {
            Some((replica, faults)) => Ok(Arc::new(FaultyReplica {
                inner: LocalReplica::new(address.to_string(), replica.clone()),
                address: address.to_string(),
                faults: faults.clone(),
            })),
            None => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "unknown test replica".into(),
            }),
        }
    }
}

/// One replica of a test volume
pub struct TestReplica {
    pub address: String,
    pub replica: Arc<Replica>,
    pub faults: Arc<Faults>,
    _dir: TempDir,
}

/// Controller plus the replicas it manages
pub struct TestVolume {
    pub controller: Arc<Controller>,
    pub connector: Arc<FaultyConnector>,
    pub replicas: Vec<TestReplica>,
}

impl TestVolume {
    /// Start a volume over `count` fresh replicas named r1..rN
    pub async fn start(count: usize, write_quorum: usize) -> Self {
        let connector = Arc::new(FaultyConnector::default());
        let mut options = ControllerOptions::new("vol", SIZE, BS);
        options.write_quorum = write_quorum;
        options.request_timeout = Duration::from_secs(5);
        let controller = Controller::new(options, connector.clone());

        let mut volume = Self {
            controller,
            connector,
            replicas: Vec::new(),
        };
        let mut addresses = Vec::new();
        for _ in 0..count {
            addresses.push(volume.new_replica().await);
        }
        volume.controller.start(&addresses).await.unwrap();
        volume
    }

    /// Register a fresh, unattached replica and return its address
    pub async fn new_replica(&mut self) -> String {
        let dir = tempdir().unwrap();
        let replica = Arc::new(Replica::new(dir.path().to_path_buf(), ChainOptions { fsync: false }));
        let address = format!("r{}", self.replicas.len() + 1);
        let faults = self.connector.register(&address, replica.clone()).await;
        self.replicas.push(TestReplica {
            address: address.clone(),
            replica,
            faults,
            _dir: dir,
        });
        address
    }

    pub fn replica(&self, address: &str) -> &TestReplica {
        self.replicas
            .iter()
            .find(|r| r.address == address)
            .unwrap()
    }

    pub async fn mode_of(&self, address: &str) -> ReplicaMode {
        self.controller
            .ls_replicas()
            .await
            .into_iter()
            .find(|r| r.address == address)
            .unwrap()
            .mode
    }
}

/// A block filled with `byte`
pub fn block(byte: u8) -> Vec<u8> {
    vec![byte; BS as usize]
}

/// Whole volume content read directly from a replica
pub async fn volume_content(replica: &Replica) -> Vec<u8> {
    replica.read_at(0, SIZE as usize).await.unwrap()
}
