use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rc_core::clock::SystemClock;
use rc_core::config::Config;
use rc_engine::client::CookieConnector;
use rc_telemetry::account_log::TracingNotifier;
use tracing::{error, info, warn};

use crate::control_api;
use crate::shutdown::ShutdownSignal;
use crate::store::JsonFileStore;
use crate::supervisor::{AccountSupervisor, SupervisorContext, SupervisorSettings};

/// How long shutdown waits for the control server to finish open requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The auto-sign background service.
///
/// Owns the account supervisor and the control API. Runs until the
/// [`ShutdownSignal`] is triggered, then stops every engine and the server.
pub struct Daemon {
    config: Config,
    supervisor: AccountSupervisor,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build a daemon with the file store and the cookie connector.
    pub async fn new(config: Config) -> Result<Self> {
        let store = JsonFileStore::open(
            &config.store.path,
            &config.store.key_path,
            config.store.invite_codes.clone(),
        )
        .await
        .context("failed to open account store")?;
        info!(path = %store.path().display(), "account store ready");

        let ctx = SupervisorContext {
            store: Arc::new(store),
            connector: Arc::new(CookieConnector::new(config.platform.clone())),
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
            platform: config.platform.clone(),
            beacons: Arc::new(config.beacon_table()),
        };
        let supervisor = AccountSupervisor::new(ctx, SupervisorSettings::from(&config));
        Ok(Self::with_supervisor(config, supervisor))
    }

    /// Build a daemon around an existing supervisor.
    pub fn with_supervisor(config: Config, supervisor: AccountSupervisor) -> Self {
        Self {
            config,
            supervisor,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn supervisor(&self) -> &AccountSupervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured control address and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.control.host, self.config.control.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind control API on {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Run on a pre-bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let accounts = self
            .supervisor
            .init()
            .await
            .context("failed to initialize accounts")?;
        info!(accounts, "daemon starting");

        let router = control_api::router(self.supervisor.clone());
        let bind_addr = listener.local_addr()?;
        let signal = self.shutdown.clone();
        let guard = self.shutdown.guard();
        let server = tokio::spawn(async move {
            let _guard = guard;
            let graceful = async move { signal.triggered().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!(error = %e, "control API server error");
            }
        });
        info!(%bind_addr, "control API listening");

        self.shutdown.triggered().await;
        info!("shutdown signal received, stopping accounts");
        self.supervisor.shutdown().await;

        if !self.shutdown.wait_for_drain(1, DRAIN_TIMEOUT).await.is_complete() {
            warn!("control API did not drain in time, aborting");
            server.abort();
        }
        info!("daemon stopped");
        Ok(())
    }
}
