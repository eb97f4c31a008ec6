//! End-to-end tests over the TCP replica protocol.
//!
//! Replica agents are served on loopback listeners and driven by a
//! controller through `RemoteConnector`.

use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use wolfblock::backup::BackupExporter;
use wolfblock::chain::ChainOptions;
use wolfblock::controller::{Controller, ControllerOptions, RebuildStatus, RemoteConnector};
use wolfblock::network::{NetworkClient, NetworkServer};
use wolfblock::replica::{Replica, ReplicaServer};
use wolfblock::state::ReplicaMode;

const BS: u32 = 4096;
const SIZE: u64 = 128 * BS as u64;

struct ServedReplica {
    address: String,
    replica: Arc<Replica>,
    server: Arc<NetworkServer>,
    _dir: TempDir,
}

async fn serve_replica() -> ServedReplica {
    let dir = tempdir().unwrap();
    let replica = Arc::new(Replica::new(dir.path().to_path_buf(), ChainOptions { fsync: false }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = Arc::new(ReplicaServer::new(replica.clone()).into_network(address.clone()));
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await });
    }

    ServedReplica {
        address,
        replica,
        server,
        _dir: dir,
    }
}

fn client() -> Arc<NetworkClient> {
    Arc::new(NetworkClient::new(Duration::from_secs(2), Duration::from_secs(10)))
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

#[tokio::test]
async fn test_volume_over_tcp_with_rebuild_and_backup() {
    let first = serve_replica().await;
    let second = serve_replica().await;

    let connector = Arc::new(RemoteConnector::new(client()));
    let controller = Controller::new(ControllerOptions::new("vol", SIZE, BS), connector);
    controller
        .start(&[first.address.clone(), second.address.clone()])
        .await
        .unwrap();

    // Both replicas were created empty by the controller
    assert_eq!(controller.ls_replicas().await.len(), 2);

    let data = pattern(3, 3 * BS as usize);
    assert_eq!(controller.write_at(0, &data).await.unwrap(), 1);
    controller.snapshot(Some("daily".into())).await.unwrap();
    controller.write_at(10 * BS as u64, &pattern(9, BS as usize)).await.unwrap();

    assert_eq!(controller.read_at(0, data.len()).await.unwrap(), data);
    assert_eq!(first.replica.revision().await, 2);
    assert_eq!(second.replica.revision().await, 2);

    // A third replica joins over TCP and is rebuilt from the others
    let third = serve_replica().await;
    controller.add_replica(&third.address).await.unwrap();
    let info = controller.wait_for_rebuild(&third.address).await.unwrap();
    assert_eq!(info.status, RebuildStatus::Completed);
    assert_eq!(info.report.blocks_transferred, 4);
    assert_eq!(third.replica.mode().await, ReplicaMode::ReadWrite);
    assert_eq!(
        third.replica.read_at(0, SIZE as usize).await.unwrap(),
        first.replica.read_at(0, SIZE as usize).await.unwrap()
    );

    // Export the snapshot from a replica over the same protocol
    let out = tempdir().unwrap();
    let image = out.path().join("daily.img");
    let manifest = BackupExporter::default()
        .export_remote(client(), &second.address, "daily", &image, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(manifest.revision, 1);
    assert_eq!(manifest.report.blocks_transferred, 3);

    let exported = std::fs::read(&image).unwrap();
    assert_eq!(exported.len() as u64, SIZE);
    assert_eq!(&exported[..data.len()], &data[..]);
    assert!(exported[10 * BS as usize..11 * BS as usize].iter().all(|b| *b == 0));

    controller.shutdown().await;
    for served in [&first, &second, &third] {
        served.server.stop();
    }
}

#[tokio::test]
async fn test_unreachable_replica_is_skipped_at_start() {
    let live = serve_replica().await;

    let connector = Arc::new(RemoteConnector::new(client()));
    let controller = Controller::new(ControllerOptions::new("vol", SIZE, BS), connector);
    controller
        .start(&[live.address.clone(), "127.0.0.1:1".to_string()])
        .await
        .unwrap();

    let replicas = controller.ls_replicas().await;
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].address, live.address);
    assert_eq!(controller.write_at(0, &pattern(1, 512)).await.unwrap(), 1);

    live.server.stop();
}
