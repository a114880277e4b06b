//! Driver binary: configuration, logging, the driver instance, and the
//! socket server with signal-driven shutdown.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zfssa_csi::driver::ZfssaDriver;
use zfssa_csi::transport::CsiServer;
use zfssa_csi::{Config, CsiError, DRIVER_NAME, DRIVER_VERSION};

/// Maps the numeric LOG_LEVEL to a tracing filter.
fn log_filter(level: u8) -> EnvFilter {
    let directive = match level {
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    };
    EnvFilter::new(directive)
}

async fn run() -> Result<(), CsiError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(config.log_level))
        .init();
    info!(
        driver = DRIVER_NAME,
        version = DRIVER_VERSION,
        appliance = %config.appliance,
        node = %config.node_name,
        "starting"
    );

    let endpoint = config.endpoint.clone();
    let driver = Arc::new(ZfssaDriver::new(DRIVER_NAME, DRIVER_VERSION, config)?);
    let server = CsiServer::bind(&endpoint, driver)?;

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| CsiError::Internal(format!("failed to install the signal handler: {e}")))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| CsiError::Internal(format!("failed to install the signal handler: {e}")))?;

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!(error = %e, "server stopped");
            }
        }
        _ = sigterm.recv() => info!("termination signal received"),
        _ = sigint.recv() => info!("interrupt received"),
    }

    if let Err(e) = std::fs::remove_file(&endpoint) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!(error = %e, "failed to remove the endpoint socket");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{DRIVER_NAME}: {e}");
        std::process::exit(1);
    }
}
