// src/main.rs

use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, warn};
use peerlink::events::{AppEvent, ProxyEvent, StorageEvent};
use peerlink::paths;
use peerlink::settings::{SettingsStore, SETTINGS_FILE};
use peerlink::App;
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const LOG_FILE: &str = "peerlink.log";

/// Headless PeerLink supervisor: runs the overlay proxy and storage daemon.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Directory holding settings, logs and the storage database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Overrides `advanced.logLevel` (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<LevelFilter>,

    /// Do not connect on startup even if `general.autoConnect` is set
    #[arg(long)]
    no_connect: bool,
}

fn init_logging(level: LevelFilter, data_dir: &Path) -> anyhow::Result<()> {
    let log_path = data_dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    CombinedLogger::init(vec![
        TermLogger::new(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto),
        WriteLogger::new(level.max(LevelFilter::Info), Config::default(), file),
    ])
    .context("Failed to initialise logging")
}

fn log_event(event: &AppEvent) {
    match event {
        AppEvent::Proxy(ProxyEvent::Status(status)) => info!("Proxy status: {}", status.as_str()),
        AppEvent::Proxy(ProxyEvent::Circuit(circuit)) if circuit.is_complete() => {
            info!("Proxy circuit: {:?}", circuit)
        }
        AppEvent::Proxy(ProxyEvent::Error(e)) | AppEvent::Storage(StorageEvent::Error(e)) => error!("{}", e),
        AppEvent::Proxy(ProxyEvent::Exited(code)) => warn!("Proxy exited with code {:?}", code),
        AppEvent::Storage(StorageEvent::Exited(code)) => warn!("Storage daemon exited with code {:?}", code),
        AppEvent::Storage(StorageEvent::Started) => info!("Storage daemon running"),
        AppEvent::Storage(StorageEvent::Stopped) => info!("Storage daemon stopped"),
        AppEvent::Storage(StorageEvent::BagsUpdated(bags)) => debug!("{} bag(s) known", bags.len()),
        // daemon output is already logged by the managers
        _ => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => paths::data_dir().context("Failed to locate the data directory")?,
    };
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let settings = SettingsStore::new(data_dir.join(SETTINGS_FILE)).into_shared();
    let initial = settings.lock().load();
    let level = cli
        .log_level
        .or_else(|| initial.advanced.log_level.parse().ok())
        .unwrap_or(LevelFilter::Info);
    init_logging(level, &data_dir)?;
    info!("Using data directory {}", data_dir.display());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let app = App::new(settings, &data_dir, event_tx);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    if initial.general.auto_connect && !cli.no_connect {
        if let Err(e) = app.connect().await {
            app.shutdown().await;
            return Err(e).context("Failed to connect");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, shutting down");
    app.shutdown().await;
    Ok(())
}
