//! Bus Poller
//!
//! Discovers and polls devices on a shared serial bus.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use buspoller::config::BusConfig;
use buspoller::link::SerialLink;
use buspoller::registry::{DeviceRegistry, MemoryRegistry};
use buspoller::services::{BusService, CommandService};
use buspoller_service::ServiceManager;

/// Serial bus poller
#[derive(Parser, Debug)]
#[command(name = "buspoller")]
#[command(about = "Discovers and polls devices on a shared serial bus", long_about = None)]
struct Args {
    /// Serial device carrying the bus
    #[arg(short, long)]
    port: Option<String>,

    /// Bus line speed
    #[arg(long)]
    baud: Option<u32>,

    /// Probe legacy devices at low speed after each poll round
    #[arg(long)]
    legacy: bool,

    /// Ignore our own transmissions looped back by the transceiver
    #[arg(long)]
    echo_suppression: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting buspoller v{}", env!("CARGO_PKG_VERSION"));

    let mut config = BusConfig::load().context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.serial.path = port;
    }
    if let Some(baud) = args.baud {
        config.serial.baud = baud;
    }
    config.legacy.enabled |= args.legacy;
    config.serial.echo_suppression |= args.echo_suppression;
    config.validate()?;

    let (tx, rx) = match SerialLink::open(&config.serial, &config.network) {
        Ok(link) => link,
        Err(e) => {
            error!("Cannot open bus link: {}", e);
            return Err(e).context("Bus link unavailable");
        }
    };

    let service_manager = Arc::new(ServiceManager::new());
    let registry: Arc<dyn DeviceRegistry> = Arc::new(MemoryRegistry::with_capacity(config.max_devices));

    service_manager
        .spawn(BusService::new(Arc::new(tx), rx, Arc::clone(&registry), config.clone()))
        .await?;
    service_manager
        .spawn(CommandService::new(&config.commands))
        .await?;

    info!("Running services:");
    for (id, state) in service_manager.list() {
        info!("  - {} ({:?})", id, state);
    }

    shutdown_signal(service_manager).await;

    let roster = registry.snapshot();
    info!(devices = roster.len(), "Shutdown complete");
    for device in roster {
        info!(
            address = %device.link_address,
            serial = %device.serial,
            duplicate = device.duplicate,
            last_seen = %device.last_seen,
            "Known device"
        );
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("buspoller=info,buspoller_service=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal(service_manager: Arc<ServiceManager>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    info!("Shutting down services...");
    if let Err(e) = service_manager.shutdown_all().await {
        warn!("Some services did not shut down cleanly: {}", e);
    }
}
