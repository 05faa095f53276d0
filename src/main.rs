use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod fs;
mod raft;
mod remote;
mod rpc;
mod store;
mod task;

#[cfg(test)]
mod cluster_tests;

use crate::config::Settings;
use crate::fs::file::FileView;
use crate::fs::inventory::Inventory;
use crate::fs::Spork;
use crate::raft::peers::Peers;
use crate::raft::snapshot::StateSource;
use crate::raft::Raft;
use crate::remote::Fetcher;
use crate::rpc::server::{serve, PeerService};
use crate::store::cache::Cache;
use crate::store::data::DataDriver;

#[derive(Parser)]
#[command(name = "sporkfs", about = "Replicated peer-to-peer filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run this peer.
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write a default configuration file.
    Init { path: PathBuf },
}

/// One running peer: the spork service, its peer endpoint, and the event
/// channels the VFS adapter consumes.
pub(crate) struct Instance {
    pub spork: Arc<Spork>,
    pub invalidations: mpsc::UnboundedReceiver<FileView>,
    pub deletions: mpsc::UnboundedReceiver<FileView>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl Instance {
    pub(crate) async fn start(settings: &Settings) -> anyhow::Result<Self> {
        let peers = Arc::new(Peers::new(
            settings.peers.all_peers.clone(),
            &settings.peers.this_peer,
            settings.peers.redundancy,
        )?);

        let data = Arc::new(DataDriver::open(settings.payload_dir()).await?);
        let cache_driver = Arc::new(DataDriver::open(settings.cache_dir()).await?);
        let cache = Cache::new(cache_driver);
        let inventory = Arc::new(Inventory::new());
        let fetcher = Arc::new(Fetcher::new(peers.clone())?);

        let shutdown = CancellationToken::new();
        let (raft_inbound_tx, raft_inbound_rx) = mpsc::channel(1024);
        let (raft, sync_rx) = Raft::start(
            peers.clone(),
            &settings.raft_dir(),
            vec![inventory.clone() as Arc<dyn StateSource>],
            raft_inbound_rx,
            shutdown.clone(),
        )?;

        let (spork, invalidations, deletions) = Spork::new(
            inventory,
            data.clone(),
            cache.clone(),
            fetcher,
            peers.clone(),
            raft,
            sync_rx,
        );

        let addr = settings.listen_addr()?;
        let service = PeerService::new(data, cache, raft_inbound_tx);
        let server_shutdown = shutdown.clone();
        let server = task::spawn_named("peer-endpoint", async move {
            if let Err(e) = serve(addr, service, server_shutdown).await {
                error!("peer endpoint failed: {e}");
            }
        });

        Ok(Instance {
            spork,
            invalidations,
            deletions,
            shutdown,
            server,
        })
    }

    pub(crate) async fn stop(self) {
        self.spork.shutdown().await;
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let mut instance = Instance::start(&settings).await?;
    info!(
        peer = settings.peers.this_peer,
        mount = %settings.mount_point.display(),
        "sporkfs is up"
    );

    // Without a mounted VFS adapter nobody consumes the event channels;
    // drain them so queued events don't accumulate for the process lifetime.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = instance.invalidations.recv() => {}
            _ = instance.deletions.recv() => {}
        }
    }

    info!("stopping sporkfs");
    instance.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { path } => {
            Settings::write_default_config(&path)?;
            println!("wrote default configuration to {}", path.display());
            Ok(())
        }
        Commands::Run { config } => {
            let settings = Settings::from_file(&config).context("loading configuration")?;
            run(settings).await
        }
    }
}
