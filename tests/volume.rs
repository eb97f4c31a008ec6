//! Volume integration tests.
//!
//! Drives a controller over several in-process replicas and checks that
//! replicas stay identical through writes, chain actions, failures and
//! rebuilds.

mod common;

use common::{block, volume_content, TestVolume, BLOCKS, BS, SIZE};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use wolfblock::chain::{ChainOptions, PrepareRemoveAction, HEAD_NAME};
use wolfblock::controller::{RebuildStatus, ReplicaAction, REBUILD_SNAPSHOT_PREFIX};
use wolfblock::replica::Replica;
use wolfblock::state::ReplicaMode;
use wolfblock::Error;

const B: u64 = BS as u64;

#[tokio::test]
async fn test_replicas_hold_identical_content_and_counters() {
    let volume = TestVolume::start(3, 1).await;
    let controller = &volume.controller;

    for i in 0..10u64 {
        let revision = controller.write_at((i % 4) * B, &block(i as u8 + 1)).await.unwrap();
        assert_eq!(revision, i + 1);
    }
    // Unaligned write spanning two blocks
    assert_eq!(controller.write_at(B / 2, &[0xAB; 512]).await.unwrap(), 11);
    assert_eq!(controller.revision(), 11);

    let reference = volume_content(&volume.replicas[0].replica).await;
    for r in &volume.replicas {
        assert_eq!(r.replica.revision().await, 11);
        assert_eq!(r.replica.mode().await, ReplicaMode::ReadWrite);
        assert_eq!(volume_content(&r.replica).await, reference);
    }
    for state in controller.ls_replicas().await {
        assert_eq!(state.revision, 11);
        assert_eq!(state.mode, ReplicaMode::ReadWrite);
    }

    let data = controller.read_at(0, 2 * BS as usize).await.unwrap();
    assert_eq!(&data[..256], &block(9)[..256]);
    assert_eq!(&data[256..768], &[0xAB; 512][..]);
    assert_eq!(&data[768..], &block(10)[256..]);
}

#[tokio::test]
async fn test_revert_is_idempotent() {
    let volume = TestVolume::start(2, 1).await;
    let controller = &volume.controller;

    controller.write_at(0, &block(1)).await.unwrap();
    controller.snapshot(Some("s1".into())).await.unwrap();
    controller.write_at(0, &block(2)).await.unwrap();
    controller.write_at(B, &block(3)).await.unwrap();

    controller.revert("s1").await.unwrap();
    let after_first = controller.read_at(0, 2 * BS as usize).await.unwrap();
    let layers_first: Vec<String> = controller.layers().await.unwrap().into_iter().map(|l| l.name).collect();

    controller.revert("s1").await.unwrap();
    let after_second = controller.read_at(0, 2 * BS as usize).await.unwrap();
    let layers_second: Vec<String> = controller.layers().await.unwrap().into_iter().map(|l| l.name).collect();

    assert_eq!(after_first, after_second);
    assert_eq!(&after_first[..BS as usize], &block(1)[..]);
    assert_eq!(&after_first[BS as usize..], &block(0)[..]);
    assert_eq!(layers_first, layers_second);
    assert_eq!(layers_first, vec![HEAD_NAME.to_string(), "s1".to_string()]);

    // The counter keeps counting after a revert
    assert_eq!(controller.write_at(2 * B, &block(4)).await.unwrap(), 4);
    let reference = volume_content(&volume.replicas[0].replica).await;
    assert_eq!(volume_content(&volume.replicas[1].replica).await, reference);

    assert!(matches!(controller.revert("missing").await, Err(Error::NotFound(_))));
    assert!(controller
        .ls_replicas()
        .await
        .iter()
        .all(|r| r.mode == ReplicaMode::ReadWrite));
}

#[tokio::test]
async fn test_rebuild_under_live_writes() {
    let mut volume = TestVolume::start(1, 1).await;
    let controller = volume.controller.clone();

    let mut rng = StdRng::seed_from_u64(7);
    for i in 0..BLOCKS {
        controller.write_at(i * B, &block(rng.gen())).await.unwrap();
    }
    controller.snapshot(Some("base".into())).await.unwrap();
    for _ in 0..16 {
        let at = rng.gen_range(0..BLOCKS);
        controller.write_at(at * B, &block(rng.gen())).await.unwrap();
    }

    let address = volume.new_replica().await;
    controller.add_replica(&address).await.unwrap();

    let writer = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(11);
            for _ in 0..40 {
                let at = rng.gen_range(0..BLOCKS);
                controller.write_at(at * B, &block(rng.gen())).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let info = controller.wait_for_rebuild(&address).await.unwrap();
    writer.await.unwrap();

    assert_eq!(info.status, RebuildStatus::Completed);
    assert_eq!(info.source.as_deref(), Some("r1"));
    assert_eq!(volume.mode_of(&address).await, ReplicaMode::ReadWrite);

    let target = &volume.replica(&address).replica;
    assert_eq!(target.revision().await, controller.revision());
    assert_eq!(
        volume_content(target).await,
        volume_content(&volume.replica("r1").replica).await
    );

    let stats = controller.stats().await;
    assert_eq!(stats.rebuilds_completed, 1);
    assert_eq!(stats.summary.read_write, 2);
    assert!(!controller.rebuild_active().await);
}

#[tokio::test]
async fn test_rebuild_transfers_only_changed_blocks() {
    let volume = TestVolume::start(3, 1).await;
    let controller = &volume.controller;

    for i in 0..4u64 {
        controller.write_at(i * B, &block(i as u8 + 1)).await.unwrap();
    }

    let r3 = volume.replica("r3");
    r3.faults.fail_writes.store(true, Ordering::SeqCst);
    assert_eq!(controller.write_at(0, &block(9)).await.unwrap(), 5);
    assert_eq!(volume.mode_of("r3").await, ReplicaMode::Errored);
    assert_eq!(r3.replica.mode().await, ReplicaMode::Errored);
    assert_eq!(r3.replica.revision().await, 4);

    r3.faults.clear();
    controller.start_rebuild("r3").await.unwrap();
    let info = controller.wait_for_rebuild("r3").await.unwrap();

    assert_eq!(info.revision, 5);
    assert_eq!(info.layers_total, 1);
    assert_eq!(info.layers_done, 1);
    assert_eq!(info.report.blocks_transferred, 1);
    assert_eq!(info.report.blocks_skipped, 3);
    assert_eq!(info.report.blocks_trimmed, 0);

    assert_eq!(volume.mode_of("r3").await, ReplicaMode::ReadWrite);
    assert_eq!(r3.replica.read_at(0, BS as usize).await.unwrap(), block(9));
    assert_eq!(
        volume_content(&r3.replica).await,
        volume_content(&volume.replica("r1").replica).await
    );
}

#[tokio::test]
async fn test_failed_rebuild_leaves_target_write_only() {
    let mut volume = TestVolume::start(1, 1).await;
    let controller = volume.controller.clone();
    controller.write_at(0, &block(1)).await.unwrap();
    controller.write_at(B, &block(2)).await.unwrap();

    let address = volume.new_replica().await;
    volume
        .replica(&address)
        .faults
        .fail_sink
        .store(true, Ordering::SeqCst);
    controller.add_replica(&address).await.unwrap();

    assert!(controller.wait_for_rebuild(&address).await.is_err());
    let info = controller.rebuild_info(&address).await.unwrap();
    assert!(matches!(info.status, RebuildStatus::Failed(_)));

    let state = controller
        .ls_replicas()
        .await
        .into_iter()
        .find(|r| r.address == address)
        .unwrap();
    assert_eq!(state.mode, ReplicaMode::WriteOnly);
    assert!(!state.rebuilding);

    // The volume keeps serving without the target
    assert_eq!(controller.write_at(2 * B, &block(3)).await.unwrap(), 3);
    assert_eq!(controller.stats().await.rebuilds_failed, 1);

    volume.replica(&address).faults.clear();
    controller.start_rebuild(&address).await.unwrap();
    controller.wait_for_rebuild(&address).await.unwrap();

    assert_eq!(volume.mode_of(&address).await, ReplicaMode::ReadWrite);
    assert_eq!(
        volume_content(&volume.replica(&address).replica).await,
        volume_content(&volume.replica("r1").replica).await
    );
}

#[tokio::test]
async fn test_write_fails_without_quorum() {
    let volume = TestVolume::start(2, 2).await;
    let controller = &volume.controller;
    controller.write_at(0, &block(1)).await.unwrap();

    volume.replica("r2").faults.fail_writes.store(true, Ordering::SeqCst);
    assert!(matches!(
        controller.write_at(0, &block(2)).await,
        Err(Error::QuorumLost { acked: 1, required: 2 })
    ));
    assert_eq!(volume.mode_of("r2").await, ReplicaMode::Errored);

    // Only one ReadWrite replica remains, below the quorum of two
    assert!(matches!(
        controller.write_at(B, &block(3)).await,
        Err(Error::QuorumLost { acked: 1, required: 2 })
    ));

    let stats = controller.stats().await;
    assert_eq!(stats.failed_writes, 2);
    assert_eq!(stats.replica_failures, 1);
    assert!(!stats.summary.has_quorum());
}

#[tokio::test]
async fn test_last_replica_failing_mid_write_loses_quorum() {
    let volume = TestVolume::start(1, 1).await;
    let controller = &volume.controller;
    controller.write_at(0, &block(1)).await.unwrap();

    volume.replica("r1").faults.fail_writes.store(true, Ordering::SeqCst);
    assert!(matches!(
        controller.write_at(0, &block(2)).await,
        Err(Error::QuorumLost { acked: 0, required: 1 })
    ));
    assert_eq!(volume.replica("r1").replica.mode().await, ReplicaMode::Errored);
    assert!(matches!(
        controller.read_at(0, BS as usize).await,
        Err(Error::QuorumLost { .. })
    ));
}

#[tokio::test]
async fn test_removing_replicas() {
    let volume = TestVolume::start(2, 1).await;
    let controller = &volume.controller;
    controller.write_at(0, &block(1)).await.unwrap();

    controller.rm_replica("r2").await.unwrap();
    assert_eq!(controller.write_at(0, &block(2)).await.unwrap(), 2);
    assert_eq!(controller.read_at(0, BS as usize).await.unwrap(), block(2));

    controller.rm_replica("r1").await.unwrap();
    assert!(controller.ls_replicas().await.is_empty());
    assert!(matches!(
        controller.write_at(0, &block(3)).await,
        Err(Error::QuorumLost { acked: 0, required: 1 })
    ));
    assert!(matches!(controller.rm_replica("r1").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_read_fails_over_to_healthy_replica() {
    let volume = TestVolume::start(2, 1).await;
    let controller = &volume.controller;
    controller.write_at(0, &block(5)).await.unwrap();

    volume.replica("r1").faults.fail_reads.store(true, Ordering::SeqCst);
    assert_eq!(controller.read_at(0, BS as usize).await.unwrap(), block(5));
    assert_eq!(controller.read_at(0, BS as usize).await.unwrap(), block(5));
    assert_eq!(volume.mode_of("r1").await, ReplicaMode::Errored);

    let stats = controller.stats().await;
    assert_eq!(stats.reads, 2);
    assert_eq!(stats.read_failovers, 1);
    assert_eq!(stats.replica_failures, 1);
}

#[tokio::test]
async fn test_remove_snapshot_respects_dependencies() {
    let volume = TestVolume::start(2, 1).await;
    let controller = &volume.controller;

    controller.write_at(0, &block(1)).await.unwrap();
    controller.snapshot(Some("s1".into())).await.unwrap();
    controller.write_at(B, &block(2)).await.unwrap();
    controller.snapshot(Some("s2".into())).await.unwrap();
    controller.write_at(0, &block(3)).await.unwrap();
    let before = controller.read_at(0, SIZE as usize).await.unwrap();

    assert!(matches!(controller.remove_snapshot("s1").await, Err(Error::Dependency(_))));
    assert!(controller
        .ls_replicas()
        .await
        .iter()
        .all(|r| r.mode == ReplicaMode::ReadWrite));

    let plan = controller.remove_snapshot("s2").await.unwrap();
    assert!(plan.contains(&PrepareRemoveAction::Coalesce {
        from: "s2".into(),
        into: HEAD_NAME.into(),
    }));
    assert_eq!(controller.read_at(0, SIZE as usize).await.unwrap(), before);

    controller.set_checkpoint("s1").await.unwrap();
    assert!(matches!(controller.remove_snapshot("s1").await, Err(Error::Dependency(_))));

    let names: Vec<String> = controller.layers().await.unwrap().into_iter().map(|l| l.name).collect();
    assert_eq!(names, vec![HEAD_NAME.to_string(), "s1".to_string()]);
    for r in &volume.replicas {
        assert_eq!(volume_content(&r.replica).await, before);
    }
}

#[tokio::test]
async fn test_replica_ahead_of_volume_is_rejected() {
    let mut volume = TestVolume::start(1, 1).await;
    let controller = volume.controller.clone();
    controller.write_at(0, &block(1)).await.unwrap();

    // A replica that took writes the volume never saw
    let address = volume.new_replica().await;
    let diverged = volume.replica(&address).replica.clone();
    diverged.create(SIZE, BS).await.unwrap();
    for i in 0..3u64 {
        diverged.write_at(i * B, &block(7)).await.unwrap();
    }

    assert!(matches!(controller.add_replica(&address).await, Err(Error::InvalidState(_))));
    assert_eq!(diverged.mode().await, ReplicaMode::Errored);
    assert_eq!(controller.ls_replicas().await.len(), 1);
}

#[tokio::test]
async fn test_start_picks_highest_revision_and_rebuilds_laggards() {
    let volume = TestVolume::start(2, 1).await;
    let controller = &volume.controller;
    controller.write_at(0, &block(1)).await.unwrap();
    volume.replica("r2").faults.fail_writes.store(true, Ordering::SeqCst);
    controller.write_at(B, &block(2)).await.unwrap();
    volume.replica("r2").faults.clear();
    controller.shutdown().await;

    // r2 is errored at revision 1, r1 is current at revision 2
    let restarted = wolfblock::controller::Controller::new(
        wolfblock::controller::ControllerOptions::new("vol", SIZE, BS),
        volume.connector.clone(),
    );
    restarted.start(&["r2".to_string(), "r1".to_string()]).await.unwrap();
    assert_eq!(restarted.revision(), 2);

    restarted.wait_for_rebuild("r2").await.unwrap();
    let states = restarted.ls_replicas().await;
    assert!(states.iter().all(|r| r.mode == ReplicaMode::ReadWrite && r.revision == 2));
    assert_eq!(
        volume_content(&volume.replica("r2").replica).await,
        volume_content(&volume.replica("r1").replica).await
    );
}

#[tokio::test]
async fn test_bootstrap_from_existing_replica() {
    let dir = tempdir().unwrap();
    let replica = Arc::new(Replica::new(dir.path().to_path_buf(), ChainOptions { fsync: false }));
    replica.create(SIZE, BS).await.unwrap();
    replica.write_at(0, &block(4)).await.unwrap();
    replica.write_at(B, &block(5)).await.unwrap();

    let connector = Arc::new(wolfblock::controller::LocalConnector::new());
    connector.register("seed", replica.clone()).await;
    let controller = wolfblock::controller::Controller::new(
        wolfblock::controller::ControllerOptions::new("vol", SIZE, BS),
        connector,
    );

    controller.add_replica("seed").await.unwrap();
    assert_eq!(controller.revision(), 2);
    assert!(!controller.rebuild_active().await);
    assert_eq!(controller.read_at(B, BS as usize).await.unwrap(), block(5));
    assert_eq!(controller.write_at(0, &block(6)).await.unwrap(), 3);
}

async fn wait_until_rebuilding(volume: &TestVolume, address: &str) {
    for _ in 0..500 {
        let rebuilding = volume
            .controller
            .ls_replicas()
            .await
            .iter()
            .any(|r| r.address == address && r.rebuilding);
        if rebuilding {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("replica {} never started receiving live writes", address);
}

#[tokio::test]
async fn test_partial_block_writes_during_rebuild() {
    let mut volume = TestVolume::start(1, 1).await;
    let controller = volume.controller.clone();

    for i in 0..BLOCKS {
        controller.write_at(i * B, &block(i as u8 + 1)).await.unwrap();
    }
    controller.snapshot(Some("base".into())).await.unwrap();

    let address = volume.new_replica().await;
    volume
        .replica(&address)
        .faults
        .sink_delay_ms
        .store(50, Ordering::SeqCst);
    controller.add_replica(&address).await.unwrap();
    wait_until_rebuilding(&volume, &address).await;

    // Inside one block, then straddling two, while the base is still in transfer
    controller.write_at(10, &[0xEE; 4]).await.unwrap();
    controller.write_at(3 * B - 3, &[0xAB; 6]).await.unwrap();

    let info = controller.wait_for_rebuild(&address).await.unwrap();
    assert_eq!(info.status, RebuildStatus::Completed);

    let source = volume_content(&volume.replica("r1").replica).await;
    assert_eq!(&source[..10], &block(1)[..10]);
    assert_eq!(&source[10..14], &[0xEE; 4]);
    assert_eq!(&source[14..B as usize], &block(1)[14..]);
    assert_eq!(&source[3 * B as usize - 3..3 * B as usize + 3], &[0xAB; 6]);
    assert_eq!(volume_content(&volume.replica(&address).replica).await, source);

    // Client byte counts are unaffected by widening
    assert_eq!(controller.stats().await.bytes_written, BLOCKS * B + 10);
}

#[tokio::test]
async fn test_oversized_request_keeps_replicas_in_quorum() {
    let volume = TestVolume::start(2, 1).await;
    let controller = &volume.controller;
    controller.write_at(0, &block(1)).await.unwrap();

    for r in &volume.replicas {
        r.faults.refuse_writes.store(true, Ordering::SeqCst);
    }
    assert!(matches!(
        controller.write_at(0, &block(2)).await,
        Err(Error::TooLarge(_))
    ));
    assert!(controller
        .ls_replicas()
        .await
        .iter()
        .all(|r| r.mode == ReplicaMode::ReadWrite));
    assert_eq!(controller.revision(), 1);
    assert_eq!(controller.stats().await.replica_failures, 0);

    for r in &volume.replicas {
        r.faults.clear();
    }
    assert_eq!(controller.write_at(0, &block(3)).await.unwrap(), 2);
    assert_eq!(controller.read_at(0, BS as usize).await.unwrap(), block(3));

    // A replica that misses a write the others took has diverged
    volume.replica("r2").faults.refuse_writes.store(true, Ordering::SeqCst);
    assert_eq!(controller.write_at(0, &block(4)).await.unwrap(), 3);
    assert_eq!(volume.mode_of("r2").await, ReplicaMode::Errored);
}

#[tokio::test]
async fn test_rebuild_snapshots_are_pruned() {
    let mut volume = TestVolume::start(1, 1).await;
    let controller = volume.controller.clone();
    controller.write_at(0, &block(1)).await.unwrap();
    controller.snapshot(Some("s1".into())).await.unwrap();
    controller.write_at(B, &block(2)).await.unwrap();

    let address = volume.new_replica().await;
    controller.add_replica(&address).await.unwrap();
    controller.wait_for_rebuild(&address).await.unwrap();

    for r in &volume.replicas {
        let names: Vec<String> = r
            .replica
            .info()
            .await
            .unwrap()
            .layers
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec![HEAD_NAME.to_string(), "s1".to_string()]);
        assert!(!names.iter().any(|n| n.starts_with(REBUILD_SNAPSHOT_PREFIX)));
    }

    controller.remove_snapshot("s1").await.unwrap();
    let expected = volume_content(&volume.replica("r1").replica).await;
    assert_eq!(&expected[..2 * BS as usize], &[block(1), block(2)].concat()[..]);
    assert_eq!(volume_content(&volume.replica(&address).replica).await, expected);

    // Finished sessions of removed replicas are forgotten
    controller.rm_replica(&address).await.unwrap();
    assert!(matches!(controller.rebuild_info(&address).await, Err(Error::NotFound(_))));
    assert!(controller.rebuilds().await.is_empty());
}

#[tokio::test]
async fn test_replica_actions_take_attached_replica_out_of_quorum() {
    let mut volume = TestVolume::start(2, 1).await;
    let controller = volume.controller.clone();
    controller.write_at(0, &block(1)).await.unwrap();

    controller
        .replica_action("r2", ReplicaAction::SetRevisionCounter { value: 40 })
        .await
        .unwrap();
    assert_eq!(volume.replica("r2").replica.revision().await, 40);
    assert_eq!(volume.mode_of("r2").await, ReplicaMode::Errored);
    assert_eq!(controller.write_at(B, &block(2)).await.unwrap(), 2);

    // A detached replica is reached through the connector
    let spare = volume.new_replica().await;
    controller
        .replica_action(&spare, ReplicaAction::Create { size: SIZE, block_size: BS })
        .await
        .unwrap();
    assert_eq!(volume.replica(&spare).replica.mode().await, ReplicaMode::ReadWrite);
    controller
        .replica_action(&spare, ReplicaAction::SetReplicaMode { mode: ReplicaMode::Errored })
        .await
        .unwrap();
    assert_eq!(volume.replica(&spare).replica.mode().await, ReplicaMode::Errored);
    controller.replica_action(&spare, ReplicaAction::Close).await.unwrap();
    controller.replica_action(&spare, ReplicaAction::Open).await.unwrap();
    assert_eq!(volume.replica(&spare).replica.mode().await, ReplicaMode::Errored);
    assert!(controller.ls_replicas().await.iter().all(|r| r.address != spare));

    assert!(matches!(
        controller
            .replica_action("nowhere", ReplicaAction::Open)
            .await,
        Err(Error::ConnectionFailed { .. })
    ));
}
