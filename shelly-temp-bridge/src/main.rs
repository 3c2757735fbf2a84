//! Shelly Temp Bridge - process entry point
//!
//! Loads the configuration, starts one poller per device on a single-threaded
//! runtime and forwards their values to the bus until the process is asked
//! to stop.

use anyhow::Result;
use shelly_temp_bridge::config::{BridgeConfig, LoggingConfig};
use shelly_temp_bridge::{logging, mqtt, Supervisor};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let (config, load_error) = match BridgeConfig::load().await {
        Ok(config) => (config, None),
        Err(e) => (BridgeConfig::default(), Some(e)),
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("[bridge] logging setup failed ({:#}), logging to stdout only", e);
        logging::init(&LoggingConfig::default()).ok();
    }
    if let Some(e) = load_error {
        error!("Configuration unusable, starting without devices: {:#}", e);
    }

    info!("Shelly temperature bridge v{} starting", env!("CARGO_PKG_VERSION"));

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::start(&config, updates_tx).await;
    let transport = mqtt::spawn_bus_transport(config.mqtt.clone(), updates_rx, supervisor.routes());

    supervisor.run_until(shutdown_signal()).await;
    transport.abort();

    info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
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
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
