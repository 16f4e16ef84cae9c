//! lanshare - send files to devices on the local network.
//!
//! ## Testing with multiple instances on one machine
//!
//! Run two instances with different config directories and ports:
//! ```bash
//! # Terminal 1
//! LANSHARE_CONFIG_DIR=/tmp/ls1 cargo run -- listen
//!
//! # Terminal 2
//! LANSHARE_CONFIG_DIR=/tmp/ls2 LANSHARE_TRANSFER_PORT=45680 cargo run -- peers
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lanshare::net::{PeerEvent, TransferEvent, TransferEventKind};
use lanshare::{AppState, Config};

#[derive(Parser, Debug)]
#[command(name = "lanshare", version, about = "Share files with devices on your local network")]
struct Cli {
    /// Name announced to other devices.
    #[arg(long, global = true, env = "LANSHARE_DEVICE_NAME")]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Announce this device and accept every incoming file until Ctrl-C.
    Listen {
        /// Directory incoming files are written to.
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },
    /// List the devices currently visible on the network.
    Peers {
        /// Seconds to listen for announcements before printing.
        #[arg(long, default_value_t = 6)]
        wait: u64,
    },
    /// Send files to a device.
    Send {
        /// Device id of the receiver, as printed by `peers`.
        #[arg(long)]
        peer: String,
        /// Seconds to wait for the receiver to be discovered.
        #[arg(long, default_value_t = 15)]
        timeout: u64,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = Config::from_env().context("reading configuration from the environment")?;
    if cli.name.is_some() {
        config.device_name = cli.name;
    }

    match cli.command {
        Command::Listen { download_dir } => {
            if let Some(dir) = download_dir {
                config.transfer.download_dir = dir;
            }
            listen(config).await
        }
        Command::Peers { wait } => peers(config, Duration::from_secs(wait)).await,
        Command::Send {
            peer,
            timeout,
            files,
        } => send(config, &peer, Duration::from_secs(timeout), &files).await,
    }
}

async fn listen(config: Config) -> Result<()> {
    let app = AppState::start(config, None).await?;
    println!(
        "{} ({}) listening, saving to {}",
        app.identity().device_name,
        app.device_id(),
        app.download_dir().display()
    );

    let peer_task = tokio::spawn(log_peer_events(app.clone(), app.subscribe_peers()));
    let transfer_task = tokio::spawn(log_transfer_events(app.clone(), app.subscribe_transfers()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = app.cancelled() => {}
    }

    app.shutdown();
    let _ = tokio::join!(peer_task, transfer_task);

    // Give sessions a moment to send their CANCEL frames.
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("Networking shutdown complete");
    Ok(())
}

async fn peers(config: Config, wait: Duration) -> Result<()> {
    let app = AppState::start(config, None).await?;
    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    let mut peers = app.peers();
    peers.sort_by(|a, b| a.device_name.cmp(&b.device_name));
    if peers.is_empty() {
        println!("No devices found");
    }
    for peer in &peers {
        println!("{}\t{}\t{}", peer.device_id, peer.device_name, peer.transfer_addr());
    }

    app.shutdown();
    Ok(())
}

async fn send(config: Config, peer_id: &str, timeout: Duration, files: &[PathBuf]) -> Result<()> {
    let app = AppState::start(config, None).await?;

    let Some(peer) = app.wait_for_peer(peer_id, timeout).await else {
        app.shutdown();
        bail!("device {peer_id} not found within {}s", timeout.as_secs());
    };
    info!(peer = %peer.device_id, name = %peer.device_name, "Sending files to peer");

    let transfer_task = tokio::spawn(log_transfer_events(app.clone(), app.subscribe_transfers()));
    let results = tokio::select! {
        results = app.send_and_wait(peer_id, files) => results,
        _ = tokio::signal::ctrl_c() => {
            app.shutdown();
            bail!("interrupted");
        }
    };
    app.shutdown();
    let _ = transfer_task.await;

    let results = results.context("starting transfers")?;
    let failed = results.iter().filter(|p| !p.is_complete()).count();
    for progress in &results {
        match &progress.error {
            Some(err) => println!("{}\t{}\t{err}", progress.file_name, progress.state.name()),
            None => println!("{}\t{}", progress.file_name, progress.state.name()),
        }
    }

    if failed > 0 {
        bail!("{failed} of {} transfers did not complete", results.len());
    }
    Ok(())
}

async fn log_peer_events(app: AppState, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    loop {
        tokio::select! {
            biased;
            _ = app.cancelled() => break,
            Some(event) = events.recv() => match event {
                PeerEvent::Added(peer) => info!(peer = %peer.device_id, name = %peer.device_name, ip = %peer.ip, "Peer discovered"),
                PeerEvent::Updated(peer) => info!(peer = %peer.device_id, name = %peer.device_name, ip = %peer.ip, "Peer updated"),
                PeerEvent::Removed(peer) => info!(peer = %peer.device_id, "Peer lost"),
            },
            else => break,
        }
    }
}

async fn log_transfer_events(app: AppState, mut events: mpsc::UnboundedReceiver<TransferEvent>) {
    loop {
        tokio::select! {
            biased;
            _ = app.cancelled() => break,
            Some(event) = events.recv() => match event.kind {
                TransferEventKind::Requested { direction, peer_id, file_name, size } => {
                    info!(transfer_id = %event.id, ?direction, peer = %peer_id, file = %file_name, size, "Transfer requested");
                }
                TransferEventKind::Progress { .. } => {}
                TransferEventKind::Failed { reason } => {
                    warn!(transfer_id = %event.id, error = %reason, "Transfer failed");
                }
                kind => info!(transfer_id = %event.id, event = ?kind, "Transfer event"),
            },
            else => break,
        }
    }
}

/// Initialize logging with tracing.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanshare=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
