//! autosign daemon: runs every registered account and serves the control API.

use anyhow::Result;
use rc_core::config::Config;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal outside development.
    let dotenv_loaded = dotenv::dotenv().is_ok();

    let (config, config_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    rc_telemetry::logging::init(
        "autosign-daemon",
        &config.general.log_level,
        config.general.json_logs,
    );
    if let Some(e) = config_error {
        warn!(error = %e, "failed to load config, using defaults");
    }
    if dotenv_loaded {
        info!("loaded environment from .env");
    }
    info!(version = env!("CARGO_PKG_VERSION"), "autosign daemon starting");

    let daemon = rc_daemon::daemon::Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
