//! bitsync-daemon: keeps a directory synchronized with a mesh of peers.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use bitsync_core::{HostPort, SyncEngine};
use bitsync_daemon::config::Config;
use bitsync_daemon::handler::ConnectionHandler;
use bitsync_daemon::native_fs::NativeFs;
use bitsync_daemon::watcher::FileWatcher;

const RECONNECT_TICK: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "bitsync-daemon")]
#[command(about = "Peer-to-peer directory sync daemon")]
struct Args {
    /// Directory holding bitsync.json
    #[arg(short, long, default_value = ".")]
    config: PathBuf,

    /// Directory to synchronize (overrides the config file)
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Peer to connect to, as host:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,bitsync_daemon=debug"
    } else {
        "info,bitsync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(&args.config)?;
    if let Some(path) = args.path {
        config.path = path;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.peers.extend(args.peers);
    let peers: Vec<HostPort> = config.peer_addresses()?;

    info!("Starting bitsync-daemon");
    info!("Share path: {:?}", config.path);
    info!("Advertising {}", config.local());

    std::fs::create_dir_all(&config.path)
        .with_context(|| format!("Failed to create share directory: {:?}", config.path))?;

    let fs = Arc::new(NativeFs::new(config.path.clone()));
    let indexed = fs.scan().await?;
    info!("Indexed {} entries", indexed.len());

    let engine = Arc::new(SyncEngine::new(fs.clone(), config.block_size));
    let handler = ConnectionHandler::new(config.handler_config(), engine);

    let listener = ConnectionHandler::<NativeFs>::bind(&format!("0.0.0.0:{}", config.port)).await?;
    info!("Listening on port {}", config.port);
    tokio::spawn(handler.clone().accept_connections(listener));

    for peer in peers {
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.try_peer(peer).await;
        });
    }

    let mut watcher = FileWatcher::new(config.path.clone())?;
    info!("File watcher started");

    let mut sync_interval = tokio::time::interval(config.sync_interval());
    sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; peers get a snapshot on connect anyway
    sync_interval.tick().await;
    let mut reconnect_tick = tokio::time::interval(RECONNECT_TICK);

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(paths) = watcher.event_rx().recv() => {
                for event in fs.refresh(paths).await {
                    debug!("Local change: {:?}", event);
                    handler.broadcast(&event);
                }
            }

            _ = sync_interval.tick() => {
                handler.sync_all().await;
            }

            _ = reconnect_tick.tick() => {
                handler.reconnect_due();
            }

            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    handler.shutdown();
    Ok(())
}
