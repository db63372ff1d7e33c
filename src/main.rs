//! pondctl: process entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  SimBoard               FileStore (postcard, JSON)             │
//! │  (BoardPort)            (RecordStore)                          │
//! │  JsonlEventLog          SystemClock                            │
//! │  (EventLog)             (Clock)                                │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │   Device × N: Interlock · Cycle timers · Reconciler    │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Global bus (emergency stop, security, config broadcasts)      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Startup order: load config → logging → stores → bootstrap every device
//! (fatal on any store error) → start → wait for a shutdown signal → stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pondctl::adapters::event_log::JsonlEventLog;
use pondctl::adapters::file_store::{Codec, FileStore};
use pondctl::adapters::sim_board::SimBoard;
use pondctl::app::ports::{Clock, EventLog, RecordStore, SystemClock};
use pondctl::app::service::{Device, Ports};
use pondctl::config::{BoardKind, DeviceSpec, ProcessConfig, StoreConfig};
use pondctl::events::Bus;
use pondctl::reconcile::Reconciler;

#[derive(Debug, Parser)]
#[command(name = "pondctl", version, about = "Interlocked pond equipment controller")]
struct Cli {
    /// TOML configuration file layered over the built-in defaults.
    #[arg(short, long, env = "PONDCTL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = ProcessConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("pondctl {} starting with {} device(s)", env!("CARGO_PKG_VERSION"), cfg.devices.len());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events: Arc<dyn EventLog> = Arc::new(JsonlEventLog::new(cfg.stores.event_log.clone()));
    let global = Bus::new("global");

    let mut devices = Vec::with_capacity(cfg.devices.len());
    for spec in &cfg.devices {
        let ports = Ports {
            board: open_board(spec),
            states: reconciler(&cfg.stores, &clock),
            configs: reconciler(&cfg.stores, &clock),
            events: events.clone(),
            clock: clock.clone(),
            global: global.clone(),
        };
        let device = Device::bootstrap(spec.clone(), ports)
            .await
            .with_context(|| format!("bootstrapping device {}", spec.id))?;
        devices.push(Arc::new(device));
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown requested");
        signal.cancel();
    });

    // Boards come up independently; one unreachable board must not hold
    // back the others.
    for device in &devices {
        let device = device.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = device.start(&shutdown).await {
                error!("{}: not started: {e}", device.id());
            }
        });
    }

    shutdown.cancelled().await;
    for device in &devices {
        device.stop().await;
    }
    info!("pondctl stopped");
    Ok(())
}

fn open_board(spec: &DeviceSpec) -> Box<dyn pondctl::app::ports::BoardPort> {
    match spec.board {
        BoardKind::Simulated => {
            let board = SimBoard::new(&spec.id);
            board.release_inputs(&spec.io_map());
            Box::new(board)
        }
    }
}

fn reconciler<R>(stores: &StoreConfig, clock: &Arc<dyn Clock>) -> Reconciler<R>
where
    R: pondctl::app::ports::Record,
{
    let primary: Arc<dyn RecordStore<R>> =
        Arc::new(FileStore::<R>::new("primary", &stores.primary_dir, Codec::Postcard));
    let secondary = stores.secondary_dir.as_ref().map(|dir| {
        Arc::new(FileStore::<R>::new("secondary", dir, Codec::Json)) as Arc<dyn RecordStore<R>>
    });
    Reconciler::new(
        primary,
        secondary,
        Duration::from_millis(stores.secondary_timeout_ms),
        clock.clone(),
    )
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
