//! Per-account polling engine.
//!
//! One [`AutoSignEngine`] owns the poll loop for one account: fetch open
//! rollcalls, dispatch each to a [`SignalResponder`] task, sleep the
//! cooldown, repeat. `stop()` waits for the loop iteration in progress and
//! every dispatched task before returning.

use crate::client::{AuthenticatedHttpClient, ClientError, PlatformApi, SessionConnector};
use crate::responder::{InFlightRegistry, SignalResponder, DEFAULT_BATCH_SIZE};
use crate::state_machine::{EngineEvent, EngineState, EngineStateMachine};
use async_trait::async_trait;
use rc_core::config::PlatformConfig;
use rc_core::types::{
    AccountId, AuthMode, BeaconTable, Credentials, Rollcall, RollcallKind, DEFAULT_COOLDOWN_MS,
};
use rc_telemetry::account_log::AccountLogger;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Emitted towards the supervisor. `instance` identifies the engine that
/// sent it, so events from a replaced engine can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    AuthExpired {
        account_id: AccountId,
        instance: u64,
        reason: String,
    },
    AuthRecovered {
        account_id: AccountId,
        instance: u64,
    },
}

impl AccountEvent {
    pub fn account_id(&self) -> AccountId {
        match self {
            AccountEvent::AuthExpired { account_id, .. }
            | AccountEvent::AuthRecovered { account_id, .. } => *account_id,
        }
    }

    pub fn instance(&self) -> u64 {
        match self {
            AccountEvent::AuthExpired { instance, .. }
            | AccountEvent::AuthRecovered { instance, .. } => *instance,
        }
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Collaborators shared by every engine the supervisor builds.
#[derive(Clone)]
pub struct EngineContext {
    pub connector: Arc<dyn SessionConnector>,
    pub platform: PlatformConfig,
    pub beacons: Arc<BeaconTable>,
    pub events: flume::Sender<AccountEvent>,
}

/// Per-account engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub cooldown: Duration,
    pub log_empty_polls: bool,
    pub preferred_beacon: Option<String>,
    pub batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            log_empty_polls: false,
            preferred_beacon: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub state: EngineState,
    pub preferred_beacon: Option<String>,
    pub cooldown_ms: u64,
    pub requests: u64,
}

/// What `dispatch` did with a rollcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    AlreadyOnCall,
    Radar,
    Numeric,
    /// A search for this numeric rollcall is already running.
    Duplicate,
    Ignored,
}

/// The start/stop surface a scheduler drives.
#[async_trait]
pub trait EngineControl: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    fn is_running(&self) -> bool;
}

// ---------------------------------------------------------------------------
// AutoSignEngine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AutoSignEngine {
    inner: Arc<Inner>,
}

struct Inner {
    account_id: AccountId,
    instance: u64,
    credentials: Credentials,
    connector: Arc<dyn SessionConnector>,
    platform: PlatformConfig,
    beacons: Arc<BeaconTable>,
    settings: EngineSettings,
    logger: Arc<AccountLogger>,
    events: flume::Sender<AccountEvent>,

    state: Mutex<EngineStateMachine>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    session: RwLock<Option<Arc<PlatformApi>>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    stop_tx: watch::Sender<bool>,
    auth_tx: flume::Sender<String>,
    auth_rx: flume::Receiver<String>,
    in_flight: InFlightRegistry,
    requests: AtomicU64,
    /// Set once a "needs re-authorization" warning went out; cleared by a
    /// successful poll so the owner is not warned on every retry.
    warned: AtomicBool,
}

impl AutoSignEngine {
    pub fn new(
        account_id: AccountId,
        credentials: Credentials,
        context: EngineContext,
        settings: EngineSettings,
        logger: Arc<AccountLogger>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(true);
        let (auth_tx, auth_rx) = flume::unbounded();
        let EngineContext {
            connector,
            platform,
            beacons,
            events,
        } = context;
        Self {
            inner: Arc::new(Inner {
                account_id,
                instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                credentials,
                connector,
                platform,
                beacons,
                settings,
                logger,
                events,
                state: Mutex::new(EngineStateMachine::new()),
                lifecycle: tokio::sync::Mutex::new(None),
                session: RwLock::new(None),
                tasks: tokio::sync::Mutex::new(JoinSet::new()),
                stop_tx,
                auth_tx,
                auth_rx,
                in_flight: InFlightRegistry::new(),
                requests: AtomicU64::new(0),
                warned: AtomicBool::new(false),
            }),
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.inner.account_id
    }

    /// Process-unique number of this engine, carried by its events.
    pub fn instance(&self) -> u64 {
        self.inner.instance
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Recent state transitions, oldest first.
    pub fn history(&self) -> Vec<(EngineState, EngineEvent, EngineState)> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history()
            .to_vec()
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.inner.state();
        EngineStatus {
            running: matches!(state, EngineState::Starting | EngineState::Running),
            state,
            preferred_beacon: self.inner.settings.preferred_beacon.clone(),
            cooldown_ms: u64::try_from(self.inner.settings.cooldown.as_millis()).unwrap_or(u64::MAX),
            requests: self.inner.requests.load(Ordering::SeqCst),
        }
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.inner.in_flight
    }

    /// Start polling. No-op while starting or running.
    ///
    /// A fresh session is built through the connector; when that fails the
    /// engine stays stopped and warns the owner.
    pub async fn start(&self) {
        let inner = &self.inner;
        let mut handle = inner.lifecycle.lock().await;
        {
            let mut sm = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if sm.is_active() {
                return;
            }
            if let Err(e) = sm.transition(EngineEvent::Start) {
                tracing::warn!(account_id = %inner.account_id, error = %e, "engine start rejected");
                return;
            }
        }

        // A previous loop that halted on its own has already finished.
        if let Some(old) = handle.take() {
            if let Err(e) = old.await {
                tracing::warn!(account_id = %inner.account_id, error = %e, "previous poll loop panicked");
            }
        }

        if let Err(e) = inner.connect().await {
            inner.transition(EngineEvent::SessionFailed);
            if e.is_auth_expired() {
                inner.emit(AccountEvent::AuthExpired {
                    account_id: inner.account_id,
                    instance: inner.instance,
                    reason: e.to_string(),
                });
            }
            if !inner.warned.swap(true, Ordering::SeqCst) {
                inner
                    .logger
                    .warn(format!("Session unavailable, engine paused until re-authorized: {e}"))
                    .await;
            } else {
                tracing::debug!(account_id = %inner.account_id, error = %e, "session still unavailable");
            }
            return;
        }

        // Reports from a previous run are stale.
        let stale = inner.auth_rx.drain().count();
        if stale > 0 {
            tracing::debug!(account_id = %inner.account_id, stale, "discarded stale auth reports");
        }
        inner.stop_tx.send_replace(false);
        inner.transition(EngineEvent::SessionReady);
        inner
            .logger
            .info(format!("Engine started for {}", inner.credentials.username()))
            .await;
        *handle = Some(tokio::spawn(run_loop(self.inner.clone())));
    }

    /// Stop polling and wait for the loop and every dispatched task.
    /// Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let mut handle = inner.lifecycle.lock().await;
        inner.stop_tx.send_replace(true);

        if let Some(h) = handle.take() {
            if let Err(e) = h.await {
                tracing::warn!(account_id = %inner.account_id, error = %e, "poll loop panicked");
            }
        }

        let mut tasks = std::mem::take(&mut *inner.tasks.lock().await);
        let pending = tasks.len();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    tracing::error!(account_id = %inner.account_id, error = %e, "rollcall task panicked");
                }
            }
        }

        let was_active = {
            let mut sm = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            sm.can_transition(EngineEvent::Stop) && sm.transition(EngineEvent::Stop).is_ok()
        };
        if was_active {
            tracing::debug!(account_id = %inner.account_id, drained = pending, "engine drained");
            inner.logger.info("Engine stopped").await;
        }
    }

    /// Hand one rollcall to a responder task.
    pub async fn dispatch(&self, rollcall: Rollcall) -> DispatchOutcome {
        self.inner.dispatch(rollcall).await
    }

    /// Poll once. Exposed for callers that drive polling themselves.
    pub async fn poll_once(&self) -> Result<usize, ClientError> {
        self.inner.poll_once().await
    }
}

#[async_trait]
impl EngineControl for AutoSignEngine {
    async fn start(&self) {
        AutoSignEngine::start(self).await
    }

    async fn stop(&self) {
        AutoSignEngine::stop(self).await
    }

    fn is_running(&self) -> bool {
        matches!(
            self.inner.state(),
            EngineState::Starting | EngineState::Running
        )
    }
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

impl Inner {
    fn state(&self) -> EngineState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).state()
    }

    fn transition(&self, event: EngineEvent) {
        let mut sm = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = sm.transition(event) {
            tracing::debug!(account_id = %self.account_id, error = %e, "ignored engine transition");
        }
    }

    fn emit(&self, event: AccountEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(account_id = %self.account_id, "account event receiver gone");
        }
    }

    async fn connect(&self) -> Result<(), ClientError> {
        let client: Arc<dyn AuthenticatedHttpClient> =
            self.connector.connect(&self.credentials).await?;
        let api = Arc::new(PlatformApi::new(client, &self.platform));
        *self.session.write().await = Some(api);
        Ok(())
    }

    async fn api(&self) -> Option<Arc<PlatformApi>> {
        self.session.read().await.clone()
    }

    async fn poll_once(&self) -> Result<usize, ClientError> {
        let req = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let api = self
            .api()
            .await
            .ok_or_else(|| ClientError::AuthExpired("no session".into()))?;
        let rollcalls = api.fetch_rollcalls().await?;
        self.warned.store(false, Ordering::SeqCst);

        if rollcalls.is_empty() {
            tracing::info!(account = self.credentials.username(), req, "no rollcalls");
            if self.settings.log_empty_polls {
                self.logger
                    .info(format!("(Req #{req}) No rollcalls found"))
                    .await;
            }
            return Ok(0);
        }

        let count = rollcalls.len();
        self.logger
            .info(format!("(Req #{req}) Found {count} rollcalls"))
            .await;
        for rollcall in rollcalls {
            self.dispatch(rollcall).await;
        }
        Ok(count)
    }

    async fn dispatch(&self, rollcall: Rollcall) -> DispatchOutcome {
        let id = rollcall.rollcall_id;
        if rollcall.is_on_call() {
            self.logger
                .info(format!("Rollcall #{id} is already on call"))
                .await;
            return DispatchOutcome::AlreadyOnCall;
        }
        let Some(api) = self.api().await else {
            tracing::debug!(account_id = %self.account_id, rollcall_id = id, "no session, rollcall skipped");
            return DispatchOutcome::Ignored;
        };

        let responder = SignalResponder::new(
            api,
            self.beacons.clone(),
            self.settings.preferred_beacon.as_deref(),
            self.logger.clone(),
        )
        .with_batch_size(self.settings.batch_size);
        let auth_tx = self.auth_tx.clone();

        match rollcall.kind() {
            RollcallKind::Radar => {
                self.logger
                    .info(format!("Answering radar rollcall #{id}: {}", rollcall.describe()))
                    .await;
                self.tasks.lock().await.spawn(async move {
                    if let Err(e) = responder.resolve_radar(id).await {
                        report_auth(&auth_tx, e);
                    }
                });
                DispatchOutcome::Radar
            }
            RollcallKind::Numeric => {
                let Some(claim) = self.in_flight.try_claim(id) else {
                    self.logger
                        .info(format!("Already searching the code of rollcall #{id}"))
                        .await;
                    return DispatchOutcome::Duplicate;
                };
                self.logger
                    .info(format!("Searching the code of number rollcall #{id}: {}", rollcall.describe()))
                    .await;
                let stop = self.stop_tx.subscribe();
                self.tasks.lock().await.spawn(async move {
                    let _claim = claim;
                    if let Err(e) = responder.resolve_numeric(id, stop).await {
                        report_auth(&auth_tx, e);
                    }
                });
                DispatchOutcome::Numeric
            }
            RollcallKind::Other => {
                self.logger
                    .info(format!("Rollcall #{id} has an unsupported type, skipped"))
                    .await;
                DispatchOutcome::Ignored
            }
        }
    }

    /// Emit the expiry upward and try once to re-establish the session.
    async fn recover(&self, reason: String) -> bool {
        tracing::warn!(account_id = %self.account_id, %reason, "auth expired");
        self.emit(AccountEvent::AuthExpired {
            account_id: self.account_id,
            instance: self.instance,
            reason: reason.clone(),
        });

        if !self.credentials.auth_mode().can_self_refresh() {
            if !self.warned.swap(true, Ordering::SeqCst) {
                self.logger
                    .warn("Session cookie expired and cannot be renewed automatically; engine paused until re-authorized")
                    .await;
            }
            return false;
        }

        match self.connect().await {
            Ok(()) => {
                self.logger.info("Session re-established").await;
                self.emit(AccountEvent::AuthRecovered {
                    account_id: self.account_id,
                    instance: self.instance,
                });
                true
            }
            Err(e) => {
                if !self.warned.swap(true, Ordering::SeqCst) {
                    self.logger
                        .warn(format!("Login failed, engine paused until re-authorized: {e}"))
                        .await;
                }
                false
            }
        }
    }

    fn reap_finished(&self, tasks: &mut JoinSet<()>) {
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                if e.is_panic() {
                    tracing::error!(account_id = %self.account_id, error = %e, "rollcall task panicked");
                }
            }
        }
    }
}

fn report_auth(auth_tx: &flume::Sender<String>, err: ClientError) {
    if let ClientError::AuthExpired(reason) = err {
        // The loop is gone when this fails; nothing is left to recover.
        let _ = auth_tx.send(reason);
    }
}

async fn run_loop(inner: Arc<Inner>) {
    let mut stop_rx = inner.stop_tx.subscribe();
    let auth_mode: AuthMode = inner.credentials.auth_mode();
    tracing::debug!(account_id = %inner.account_id, %auth_mode, "poll loop started");

    loop {
        if *stop_rx.borrow() {
            break;
        }
        {
            let mut tasks = inner.tasks.lock().await;
            inner.reap_finished(&mut tasks);
        }

        let mut expired = match inner.poll_once().await {
            Ok(_) => None,
            Err(ClientError::AuthExpired(reason)) => Some(reason),
            Err(e) => {
                tracing::warn!(account = inner.credentials.username(), error = %e, "failed to fetch rollcalls");
                None
            }
        };
        // Several tasks may report the same expiry; handle it once.
        for reason in inner.auth_rx.drain() {
            expired.get_or_insert(reason);
        }

        if let Some(reason) = expired {
            if *stop_rx.borrow() {
                break;
            }
            if inner.recover(reason).await {
                continue;
            }
            inner.transition(EngineEvent::AuthLost);
            tracing::warn!(account_id = %inner.account_id, "engine halted after auth expiry");
            break;
        }

        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.settings.cooldown) => {}
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
        }
    }
    tracing::debug!(account_id = %inner.account_id, "poll loop exited");
}
