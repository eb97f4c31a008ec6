//! WolfBlock - Synchronously Replicated Block Storage
//!
//! Runs a volume controller, a replica agent, the layer sync agent or a
//! backup export, depending on the subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use wolfblock::api::HttpServer;
use wolfblock::backup::BackupExporter;
use wolfblock::chain::ChainOptions;
use wolfblock::config::{LoggingConfig, WolfBlockConfig};
use wolfblock::controller::{Controller, ControllerOptions, RemoteConnector};
use wolfblock::error::{Error, Result};
use wolfblock::logging::{init_logging, LogLevelControl};
use wolfblock::network::NetworkClient;
use wolfblock::replica::{Replica, ReplicaServer};
use wolfblock::sync::{SyncAgent, SyncOptions};

/// WolfBlock - Synchronously Replicated Block Storage
#[derive(Parser)]
#[command(name = "wolfblock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfblock.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the volume controller and its HTTP API
    Controller,

    /// Run a replica agent serving the local snapshot chain
    Replica,

    /// Copy one layer of a remote replica into a staged layer file
    SyncAgent {
        /// Replica to copy from (host:port)
        #[arg(short, long)]
        address: String,

        /// Layer to copy
        #[arg(long)]
        layer: String,

        /// Staged file to write; resumed when it already exists
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Export a snapshot into a flat image file
    Backup {
        /// Replica to read from (host:port)
        #[arg(short, long)]
        address: String,

        /// Snapshot to export
        #[arg(short, long)]
        snapshot: String,

        /// Image path (defaults to <data_dir>/backups/<snapshot>.img)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfblock.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        command => {
            let mut config = match WolfBlockConfig::from_file(&cli.config) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Failed to load configuration from {:?}: {}", cli.config, e);
                    return Err(e);
                }
            };
            if let Some(level) = cli.log_level {
                config.logging.level = level;
            }
            let log_control = init_logging(&config.logging);

            // Panics inside a command surface as a fatal error instead of aborting mid-write
            let task = tokio::spawn(run_command(command, config, log_control));
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Command aborted: {}", e);
                    Err(Error::Fatal(format!("Command aborted: {}", e)))
                }
            }
        }
    }
}

async fn run_command(
    command: Commands,
    config: WolfBlockConfig,
    log_control: LogLevelControl,
) -> Result<()> {
    match command {
        Commands::Controller => run_controller(config).await,
        Commands::Replica => run_replica(config, log_control).await,
        Commands::SyncAgent { address, layer, output } => {
            run_sync_agent(config, address, layer, output).await
        }
        Commands::Backup { address, snapshot, output } => {
            run_backup(config, address, snapshot, output).await
        }
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

fn network_client(config: &WolfBlockConfig) -> Arc<NetworkClient> {
    Arc::new(NetworkClient::new(
        config.controller.connect_timeout(),
        config.controller.request_timeout(),
    ))
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            token.cancel();
        }
    });
}

/// Run the volume controller
async fn run_controller(config: WolfBlockConfig) -> Result<()> {
    tracing::info!(
        "Starting controller {} for volume {} ({} replicas, write quorum {})",
        config.node.id,
        config.volume.name,
        config.volume.replicas.len(),
        config.volume.write_quorum
    );

    let connector = Arc::new(RemoteConnector::new(network_client(&config)));
    let controller = Controller::new(ControllerOptions::from_config(&config), connector);
    if let Err(e) = controller.start(&config.volume.replicas).await {
        tracing::error!("Failed to start volume {}: {}", config.volume.name, e);
        return Err(e);
    }

    let api = HttpServer::new(config.api.clone(), controller.clone());
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.start().await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    api_task.abort();
    controller.shutdown().await;
    tracing::info!("WolfBlock controller shutdown complete");
    Ok(())
}

/// Run a replica agent
async fn run_replica(config: WolfBlockConfig, log_control: LogLevelControl) -> Result<()> {
    let dir = config.replica_dir();
    tracing::info!("Starting replica agent {} in {:?}", config.node.id, dir);

    let replica = Arc::new(
        Replica::new(dir.clone(), ChainOptions { fsync: config.node.fsync })
            .with_log_control(log_control),
    );
    if let Err(e) = replica.open_or_create(config.volume.size, config.volume.block_size).await {
        tracing::error!("Failed to open replica in {:?}: {}", dir, e);
        return Err(e);
    }

    let server = Arc::new(ReplicaServer::new(replica.clone()).into_network(config.node.bind_address.clone()));
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Replica server error: {}", e);
                    return Err(e);
                }
                Err(e) => return Err(Error::Fatal(format!("Replica server aborted: {}", e))),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
        }
    }

    replica.shutdown().await?;
    tracing::info!("WolfBlock replica shutdown complete");
    Ok(())
}

/// Stage one layer of a remote replica for `replace_disk`
async fn run_sync_agent(
    config: WolfBlockConfig,
    address: String,
    layer: String,
    output: PathBuf,
) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let agent = SyncAgent::new(SyncOptions::from(&config.sync));
    let report = agent
        .stage_layer(network_client(&config), &address, &layer, output.clone(), &cancel)
        .await?;

    println!(
        "Staged layer {} from {} into {}: {} blocks copied, {} unchanged, {} trimmed ({} bytes sent in {} ms)",
        layer,
        address,
        output.display(),
        report.blocks_transferred,
        report.blocks_skipped,
        report.blocks_trimmed,
        report.bytes_sent,
        report.elapsed_ms
    );
    Ok(())
}

/// Export a snapshot into a flat image
async fn run_backup(
    config: WolfBlockConfig,
    address: String,
    snapshot: String,
    output: Option<PathBuf>,
) -> Result<()> {
    let output = match output {
        Some(path) => path,
        None => {
            std::fs::create_dir_all(config.backup_dir())?;
            config.backup_dir().join(format!("{}.img", snapshot))
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let exporter = BackupExporter::new(SyncOptions::from(&config.sync));
    let manifest = exporter
        .export_remote(network_client(&config), &address, &snapshot, &output, &cancel)
        .await?;

    println!(
        "Exported snapshot {} to {} ({} blocks copied, {} unchanged, sha256 {})",
        manifest.snapshot,
        output.display(),
        manifest.report.blocks_transferred,
        manifest.report.blocks_skipped,
        manifest.sha256
    );
    Ok(())
}

/// Write a starter configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfBlock Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:9502"
data_dir = "/var/lib/wolfblock/{node_id}"
fsync = true

[volume]
name = "vol0"
size = 10737418240
block_size = 4096
write_quorum = 1
replicas = []
# replicas = ["replica-1.example.com:9502", "replica-2.example.com:9502"]

[controller]
connect_timeout_ms = 5000
request_timeout_ms = 10000
sync_timeout_ms = 600000
rebuild_on_start = true

[sync]
batch_blocks = 256
compression = true

[api]
enabled = true
bind_address = "0.0.0.0:9501"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
# file = "/var/log/wolfblock/wolfblock.log"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nOn replica nodes start with: wolfblock --config {} replica", output.display());
    println!("On the controller list the replicas and start with: wolfblock --config {} controller", output.display());

    Ok(())
}

/// Validate a configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    let _ = init_logging(&LoggingConfig::default());

    match WolfBlockConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration is valid: {}", config_path.display());
            println!("  Node: {} ({})", config.node.id, config.node.bind_address);
            println!("  Data dir: {}", config.node.data_dir.display());
            println!(
                "  Volume: {} ({} bytes, block size {}, write quorum {})",
                config.volume.name, config.volume.size, config.volume.block_size, config.volume.write_quorum
            );
            println!("  Replicas: {}", config.volume.replicas.join(", "));
            Ok(())
        }
        Err(e) => {
            println!("Configuration is invalid: {}", e);
            Err(e)
        }
    }
}
