//! Transfer Engine
//!
//! Compares digests on both sides and moves only the differing ranges.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{LayerFileSink, RemoteSource, SyncOptions, SyncSink, SyncSource};
use crate::chain::{BlockRange, LayerView};
use crate::error::{Error, Result};
use crate::network::{Message, NetworkClient};

/// Trims carry no payload, so their ranges can be long
const TRIM_BATCH_BLOCKS: usize = 1 << 20;

/// Blocks covered by one digest exchange
const DIGEST_WINDOW_BLOCKS: u32 = 1 << 18;

/// Outcome of one transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Ranges written or trimmed
    pub ranges: usize,
    pub blocks_transferred: u64,
    /// Blocks whose digests already matched
    pub blocks_skipped: u64,
    pub blocks_trimmed: u64,
    /// Payload bytes moved (after compression)
    pub bytes_sent: u64,
    pub elapsed_ms: u64,
}

impl SyncReport {
    /// Accumulate another report
    pub fn merge(&mut self, other: &SyncReport) {
        self.ranges += other.ranges;
        self.blocks_transferred += other.blocks_transferred;
        self.blocks_skipped += other.blocks_skipped;
        self.blocks_trimmed += other.blocks_trimmed;
        self.bytes_sent += other.bytes_sent;
        self.elapsed_ms += other.elapsed_ms;
    }
}

/// Completion of one range
#[derive(Debug, Clone, Copy)]
pub struct RangeDone {
    pub range: BlockRange,
    /// Ranges finished so far, this one included
    pub completed: usize,
    /// Ranges planned in the windows compared so far
    pub total: usize,
}

/// State of one transfer across digest windows
struct Run<'a> {
    cancel: &'a CancellationToken,
    progress: &'a (dyn Fn(RangeDone) + Send + Sync),
    report: SyncReport,
    completed: usize,
    total: usize,
}

impl Run<'_> {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn done(&mut self, range: BlockRange) {
        self.completed += 1;
        (self.progress)(RangeDone {
            range,
            completed: self.completed,
            total: self.total,
        });
    }
}

fn transfer_error(stage: &str, side: &str, e: Error) -> Error {
    match e {
        Error::Cancelled => Error::Cancelled,
        other => Error::Transfer(format!("{} on {} failed: {}", stage, side, other)),
    }
}

/// Differential transfer worker
#[derive(Debug, Clone, Default)]
pub struct SyncAgent {
    options: SyncOptions,
}

impl SyncAgent {
    pub fn new(options: SyncOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Make `sink` hold exactly the blocks of `source` within the first
    /// `blocks` blocks of the volume
    pub async fn transfer(
        &self,
        source: &dyn SyncSource,
        sink: &dyn SyncSink,
        blocks: u64,
        cancel: &CancellationToken,
        progress: &(dyn Fn(RangeDone) + Send + Sync),
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let mut run = Run {
            cancel,
            progress,
            report: SyncReport::default(),
            completed: 0,
            total: 0,
        };

        for window in BlockRange::windows(blocks, DIGEST_WINDOW_BLOCKS) {
            run.check_cancelled()?;
            self.sync_window(source, sink, window, &mut run).await?;
        }
        let mut report = run.report;

        sink.finish()
            .await
            .map_err(|e| transfer_error("flush", &sink.describe(), e))?;

        tracing::debug!(
            "Sync {} -> {} done: {} blocks copied, {} trimmed, {} already matched",
            source.describe(),
            sink.describe(),
            report.blocks_transferred,
            report.blocks_trimmed,
            report.blocks_skipped
        );
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Diff and move the blocks of one digest window
    async fn sync_window(
        &self,
        source: &dyn SyncSource,
        sink: &dyn SyncSink,
        window: BlockRange,
        run: &mut Run<'_>,
    ) -> Result<()> {
        let source_name = source.describe();
        let sink_name = sink.describe();

        let (source_digests, sink_digests) = tokio::try_join!(
            async { source.digests(window).await.map_err(|e| transfer_error("digest", &source_name, e)) },
            async { sink.digests(window).await.map_err(|e| transfer_error("digest", &sink_name, e)) },
        )?;

        let held: HashMap<u64, _> = sink_digests.into_iter().map(|c| (c.block, c.digest)).collect();
        let mut wanted = Vec::new();
        let mut present = HashSet::with_capacity(source_digests.len());

        for checksum in &source_digests {
            present.insert(checksum.block);
            if held.get(&checksum.block) == Some(&checksum.digest) {
                run.report.blocks_skipped += 1;
            } else {
                wanted.push(checksum.block);
            }
        }
        wanted.sort_unstable();

        let mut extra: Vec<u64> = held.keys().filter(|b| !present.contains(b)).copied().collect();
        extra.sort_unstable();

        let ranges = BlockRange::coalesce(wanted, self.options.batch_blocks);
        let trims = BlockRange::coalesce(extra, TRIM_BATCH_BLOCKS);
        run.total += ranges.len() + trims.len();

        for range in ranges {
            run.check_cancelled()?;
            let payload = tokio::select! {
                payload = source.read_blocks(range) => {
                    payload.map_err(|e| transfer_error("read", &source_name, e))?
                }
                _ = run.cancel.cancelled() => return Err(Error::Cancelled),
            };
            run.report.bytes_sent += payload.wire_len() as u64;
            sink.write_blocks(range.first, payload)
                .await
                .map_err(|e| transfer_error("write", &sink_name, e))?;

            run.report.blocks_transferred += range.count as u64;
            run.report.ranges += 1;
            run.done(range);
        }

        for range in trims {
            run.check_cancelled()?;
            sink.trim_blocks(range)
                .await
                .map_err(|e| transfer_error("trim", &sink_name, e))?;

            run.report.blocks_trimmed += range.count as u64;
            run.report.ranges += 1;
            run.done(range);
        }
        Ok(())
    }

    /// Diff-sync one layer of a remote replica into a staged layer file
    pub async fn stage_layer(
        &self,
        client: Arc<NetworkClient>,
        address: &str,
        layer: &str,
        target: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let info = match client.send(address, Message::GetInfo).await? {
            Message::Info(info) => info,
            other => {
                return Err(Error::Transfer(format!(
                    "Unexpected {} response from {}",
                    other.type_name(),
                    address
                )))
            }
        };
        if !info.layers.iter().any(|l| l.name == layer) {
            return Err(Error::NotFound(format!("Layer {} is not on {}", layer, address)));
        }

        let sink = LayerFileSink::open_or_create(target, info.block_size)?;
        let source = RemoteSource::new(
            client,
            address.to_string(),
            layer.to_string(),
            LayerView::Own,
            self.options.compression,
        );

        let blocks = info.size / info.block_size.max(1) as u64;
        self.transfer(&source, &sink, blocks, cancel, &|done| {
            tracing::info!(
                "Range {}+{} done ({}/{})",
                done.range.first,
                done.range.count,
                done.completed,
                done.total
            );
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{block_digest, BlockChecksum};
    use crate::network::BlockPayload;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    const BS: usize = 16;

    struct MemSource(BTreeMap<u64, Vec<u8>>);

    #[async_trait::async_trait]
    impl SyncSource for MemSource {
        fn describe(&self) -> String {
            "mem-source".into()
        }

        async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
            Ok(self
                .0
                .range(range.first..range.end())
                .map(|(block, data)| BlockChecksum { block: *block, digest: block_digest(data) })
                .collect())
        }

        async fn read_blocks(&self, range: BlockRange) -> Result<BlockPayload> {
            let mut data = Vec::new();
            for block in range.first..range.end() {
                data.extend_from_slice(&self.0[&block]);
            }
            Ok(BlockPayload::encode(data, true))
        }
    }

    #[derive(Default)]
    struct MemSink {
        blocks: Mutex<BTreeMap<u64, Vec<u8>>>,
        writes: Mutex<Vec<BlockRange>>,
        queried: Mutex<Vec<BlockRange>>,
    }

    #[async_trait::async_trait]
    impl SyncSink for MemSink {
        fn describe(&self) -> String {
            "mem-sink".into()
        }

        async fn digests(&self, range: BlockRange) -> Result<Vec<BlockChecksum>> {
            self.queried.lock().await.push(range);
            Ok(self
                .blocks
                .lock()
                .await
                .range(range.first..range.end())
                .map(|(block, data)| BlockChecksum { block: *block, digest: block_digest(data) })
                .collect())
        }

        async fn write_blocks(&self, first: u64, payload: BlockPayload) -> Result<()> {
            let data = payload.decode()?;
            let mut blocks = self.blocks.lock().await;
            for (i, chunk) in data.chunks(BS).enumerate() {
                blocks.insert(first + i as u64, chunk.to_vec());
            }
            self.writes
                .lock()
                .await
                .push(BlockRange::new(first, (data.len() / BS) as u32));
            Ok(())
        }

        async fn trim_blocks(&self, range: BlockRange) -> Result<()> {
            let mut blocks = self.blocks.lock().await;
            for block in range.first..range.end() {
                blocks.remove(&block);
            }
            Ok(())
        }

        async fn finish(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_only_differing_blocks_move() {
        let source = MemSource(
            (0..6u64).map(|b| (b, vec![b as u8; BS])).collect(),
        );
        let sink = MemSink::default();
        {
            let mut blocks = sink.blocks.lock().await;
            for b in [0u64, 1, 2, 4] {
                blocks.insert(b, vec![b as u8; BS]);
            }
            blocks.insert(3, vec![0xFF; BS]);
            blocks.insert(9, vec![9; BS]);
        }

        let agent = SyncAgent::new(SyncOptions { batch_blocks: 2, compression: true });
        let report = agent
            .transfer(&source, &sink, 16, &CancellationToken::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(report.blocks_skipped, 4);
        assert_eq!(report.blocks_transferred, 2);
        assert_eq!(report.blocks_trimmed, 1);
        assert_eq!(*sink.writes.lock().await, vec![BlockRange::new(3, 1), BlockRange::new(5, 1)]);
        assert_eq!(*sink.blocks.lock().await, source.0);
    }

    #[tokio::test]
    async fn test_digests_are_exchanged_per_window() {
        let far = DIGEST_WINDOW_BLOCKS as u64 + 5;
        let source = MemSource([(1u64, vec![1; BS]), (far, vec![2; BS])].into_iter().collect());
        let sink = MemSink::default();
        sink.blocks.lock().await.insert(far + 1, vec![3; BS]);

        let blocks = far + 10;
        let agent = SyncAgent::default();
        let report = agent
            .transfer(&source, &sink, blocks, &CancellationToken::new(), &|_| {})
            .await
            .unwrap();

        assert_eq!(report.blocks_transferred, 2);
        assert_eq!(report.blocks_trimmed, 1);
        assert_eq!(
            *sink.queried.lock().await,
            vec![
                BlockRange::new(0, DIGEST_WINDOW_BLOCKS),
                BlockRange::new(DIGEST_WINDOW_BLOCKS as u64, 10 + 5),
            ]
        );
        assert_eq!(*sink.blocks.lock().await, source.0);
    }

    #[tokio::test]
    async fn test_cancelled_transfer_stops() {
        let source = MemSource((0..4u64).map(|b| (b, vec![1; BS])).collect());
        let sink = MemSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let agent = SyncAgent::default();
        let result = agent.transfer(&source, &sink, 4, &cancel, &|_| {}).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
