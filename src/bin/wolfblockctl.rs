//! WolfBlockCtl - Command line tool for managing WolfBlock volumes
//!
//! Usage:
//!   wolfblockctl ls-replica              - Show replicas and their modes
//!   wolfblockctl add-replica <address>   - Attach and rebuild a replica
//!   wolfblockctl rm-replica <address>    - Detach a replica
//!   wolfblockctl snapshot [name]         - Snapshot the volume
//!   wolfblockctl revert <name>           - Revert the volume to a snapshot
//!   wolfblockctl rebuild-info            - Show rebuild progress
//!   wolfblockctl stats                   - Show volume statistics
//!
//! Replica administration (works on attached and detached replicas):
//!   wolfblockctl replica-open <address>
//!   wolfblockctl replica-close <address>
//!   wolfblockctl replica-create <address> <size> <block-size>
//!   wolfblockctl set-revision-counter <address> <value>
//!   wolfblockctl set-replica-mode <address> <RW|WO|ERR>
//!   wolfblockctl set-logging <address> <level>
//!   wolfblockctl replace-disk <address> <old> <staged>

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

use wolfblock::api::{
    ActionResponse, AddReplicaRequest, ErrorResponse, NamedRequest, SnapshotRequest, SnapshotResponse,
};
use wolfblock::controller::{RebuildInfo, RebuildStatus, ReplicaAction, VolumeStats};
use wolfblock::state::{ReplicaMode, ReplicaState};

/// WolfBlock Volume Control Tool
#[derive(Parser)]
#[command(name = "wolfblockctl")]
#[command(about = "Control and monitor WolfBlock volumes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfblock/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List replicas and their modes
    LsReplica,
    /// Attach a replica; it is rebuilt before serving reads
    AddReplica {
        /// Replica address (host:port)
        address: String,
    },
    /// Detach a replica
    RmReplica {
        /// Replica address (host:port)
        address: String,
    },
    /// Snapshot the volume
    Snapshot {
        /// Snapshot name (generated when omitted)
        name: Option<String>,
    },
    /// Revert the volume to a snapshot
    Revert {
        /// Snapshot name
        name: String,
    },
    /// Show rebuild progress
    RebuildInfo {
        /// Only show the rebuild of this replica
        address: Option<String>,
    },
    /// Show volume statistics
    Stats,
    /// Open a replica's chain
    ReplicaOpen {
        address: String,
    },
    /// Close a replica; an attached one leaves the quorum
    ReplicaClose {
        address: String,
    },
    /// Create an empty chain on a replica
    ReplicaCreate {
        address: String,
        /// Volume size in bytes
        size: u64,
        block_size: u32,
    },
    /// Override a replica's revision counter
    SetRevisionCounter {
        address: String,
        value: u64,
    },
    /// Override a replica's mode, bypassing the state machine
    SetReplicaMode {
        address: String,
        #[arg(value_parser = parse_mode)]
        mode: ReplicaMode,
    },
    /// Change a replica's log level at runtime
    SetLogging {
        address: String,
        /// Level or filter directive, e.g. "debug"
        level: String,
    },
    /// Swap a layer file for a staged copy
    ReplaceDisk {
        address: String,
        old: String,
        staged: String,
    },
}

fn parse_mode(value: &str) -> std::result::Result<ReplicaMode, String> {
    value.parse().map_err(|e: wolfblock::Error| e.to_string())
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:9501".to_string()
}

fn endpoint_from_config(path: &Path) -> String {
    let bind = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    // A wildcard bind is reached through loopback
    match bind.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", bind),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let api = Api::new(endpoint);

    let result = match &cli.command {
        Commands::LsReplica => ls_replica(&api).await,
        Commands::AddReplica { address } => add_replica(&api, address).await,
        Commands::RmReplica { address } => rm_replica(&api, address).await,
        Commands::Snapshot { name } => snapshot(&api, name.clone()).await,
        Commands::Revert { name } => revert(&api, name).await,
        Commands::RebuildInfo { address } => rebuild_info(&api, address.as_deref()).await,
        Commands::Stats => stats(&api).await,
        Commands::ReplicaOpen { address } => replica_action(&api, address, ReplicaAction::Open).await,
        Commands::ReplicaClose { address } => replica_action(&api, address, ReplicaAction::Close).await,
        Commands::ReplicaCreate {
            address,
            size,
            block_size,
        } => {
            let action = ReplicaAction::Create {
                size: *size,
                block_size: *block_size,
            };
            replica_action(&api, address, action).await
        }
        Commands::SetRevisionCounter { address, value } => {
            replica_action(&api, address, ReplicaAction::SetRevisionCounter { value: *value }).await
        }
        Commands::SetReplicaMode { address, mode } => {
            replica_action(&api, address, ReplicaAction::SetReplicaMode { mode: *mode }).await
        }
        Commands::SetLogging { address, level } => {
            let action = ReplicaAction::SetLogging {
                level: level.clone(),
            };
            replica_action(&api, address, action).await
        }
        Commands::ReplaceDisk {
            address,
            old,
            staged,
        } => {
            let action = ReplicaAction::ReplaceDisk {
                old: old.clone(),
                staged: staged.clone(),
            };
            replica_action(&api, address, action).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

// ============ API Client ============

struct Api {
    endpoint: String,
    client: reqwest::Client,
}

impl Api {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            match response.json::<ErrorResponse>().await {
                Ok(error) => bail!("{} ({})", error.error, status),
                Err(_) => bail!("API error: {}", status),
            }
        }
        response.json().await.context("Invalid API response")
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("Cannot reach {}", self.endpoint))?;
        Self::decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Cannot reach {}", self.endpoint))?;
        Self::decode(response).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .delete(self.url(path))
            .send()
            .await
            .with_context(|| format!("Cannot reach {}", self.endpoint))?;
        Self::decode(response).await
    }
}

// ============ Commands ============

fn colored_mode(mode: ReplicaMode) -> String {
    // Pad before adding color codes
    let padded = format!("{:<6}", mode.as_str());
    match mode {
        ReplicaMode::ReadWrite => format!("\x1b[32m{}\x1b[0m", padded),
        ReplicaMode::WriteOnly => format!("\x1b[33m{}\x1b[0m", padded),
        ReplicaMode::Errored => format!("\x1b[31m{}\x1b[0m", padded),
    }
}

async fn ls_replica(api: &Api) -> Result<()> {
    let replicas: Vec<ReplicaState> = api.get("/v1/replicas").await?;

    println!("{:<30} {:<6} {:>12} {:>10} {:<10}", "ADDRESS", "MODE", "REVISION", "IN FLIGHT", "REBUILDING");
    println!("{}", "-".repeat(72));
    for replica in &replicas {
        println!(
            "{:<30} {} {:>12} {:>10} {:<10}",
            replica.address,
            colored_mode(replica.mode),
            replica.revision,
            replica.in_flight,
            if replica.rebuilding { "yes" } else { "" }
        );
    }
    Ok(())
}

async fn add_replica(api: &Api, address: &str) -> Result<()> {
    let request = AddReplicaRequest {
        address: address.to_string(),
    };
    let response: ActionResponse = api.post("/v1/replicas", &request).await?;
    println!("{}", response.message.unwrap_or_else(|| "Replica added".into()));
    println!("Follow the rebuild with: wolfblockctl rebuild-info {}", address);
    Ok(())
}

async fn rm_replica(api: &Api, address: &str) -> Result<()> {
    let response: ActionResponse = api.delete(&format!("/v1/replicas/{}", address)).await?;
    println!("{}", response.message.unwrap_or_else(|| "Replica removed".into()));
    Ok(())
}

async fn replica_action(api: &Api, address: &str, action: ReplicaAction) -> Result<()> {
    let name = action.name();
    let response: ActionResponse = api
        .post(&format!("/v1/replicas/{}/action", address), &action)
        .await?;
    println!(
        "{}",
        response.message.unwrap_or_else(|| format!("Replica {} {} done", address, name))
    );
    Ok(())
}

async fn snapshot(api: &Api, name: Option<String>) -> Result<()> {
    let response: SnapshotResponse = api.post("/v1/snapshot", &SnapshotRequest { name }).await?;
    println!("Created snapshot {} at revision {}", response.name, response.revision);
    Ok(())
}

async fn revert(api: &Api, name: &str) -> Result<()> {
    let request = NamedRequest {
        name: name.to_string(),
    };
    let response: ActionResponse = api.post("/v1/revert", &request).await?;
    println!("{}", response.message.unwrap_or_else(|| format!("Reverted to {}", name)));
    Ok(())
}

fn print_rebuild(info: &RebuildInfo) {
    let status = match &info.status {
        RebuildStatus::Failed(reason) => format!("failed: {}", reason),
        other => format!("{:?}", other).to_lowercase(),
    };
    println!("Replica {} <- {}", info.target, info.source.as_deref().unwrap_or("-"));
    println!("  Status:   {}", status);
    println!("  Revision: {}", info.revision);
    println!(
        "  Layers:   {}/{}{}",
        info.layers_done,
        info.layers_total,
        info.current_layer
            .as_ref()
            .map(|l| format!(" (copying {}: {}/{} ranges)", l, info.ranges_completed, info.ranges_total))
            .unwrap_or_default()
    );
    println!(
        "  Blocks:   {} copied, {} unchanged, {} trimmed, {} bytes sent",
        info.report.blocks_transferred,
        info.report.blocks_skipped,
        info.report.blocks_trimmed,
        info.report.bytes_sent
    );
}

async fn rebuild_info(api: &Api, address: Option<&str>) -> Result<()> {
    match address {
        Some(address) => {
            let info: RebuildInfo = api.get(&format!("/v1/rebuildinfo?address={}", address)).await?;
            print_rebuild(&info);
        }
        None => {
            let infos: Vec<RebuildInfo> = api.get("/v1/rebuildinfo").await?;
            if infos.is_empty() {
                println!("No rebuilds recorded");
            }
            for info in &infos {
                print_rebuild(info);
            }
        }
    }
    Ok(())
}

async fn stats(api: &Api) -> Result<()> {
    let stats: VolumeStats = api.get("/v1/stats").await?;
    let summary = &stats.summary;

    println!("Revision:  {}", summary.revision);
    println!(
        "Replicas:  {} total, {} RW, {} WO, {} ERR (write quorum {}{})",
        summary.total_replicas,
        summary.read_write,
        summary.write_only,
        summary.errored,
        summary.write_quorum,
        if summary.has_quorum() { "" } else { ", NOT MET" }
    );
    println!("Reads:     {} ({} bytes, {} failovers)", stats.reads, stats.bytes_read, stats.read_failovers);
    println!("Writes:    {} ({} bytes, {} failed)", stats.writes, stats.bytes_written, stats.failed_writes);
    println!("Failures:  {} replicas errored", stats.replica_failures);
    println!(
        "Rebuilds:  {} completed, {} failed{}",
        stats.rebuilds_completed,
        stats.rebuilds_failed,
        if summary.rebuilding { ", one running" } else { "" }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_admin_commands_parse() {
        let cli = Cli::try_parse_from(["wolfblockctl", "set-replica-mode", "10.0.0.2:9500", "err"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::SetReplicaMode {
                mode: ReplicaMode::Errored,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["wolfblockctl", "replica-create", "r1", "1048576", "4096"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::ReplicaCreate {
                size: 1048576,
                block_size: 4096,
                ..
            }
        ));

        assert!(Cli::try_parse_from(["wolfblockctl", "set-replica-mode", "r1", "bogus"]).is_err());
        assert!(Cli::try_parse_from(["wolfblockctl", "set-revision-counter", "r1"]).is_err());
    }
}
