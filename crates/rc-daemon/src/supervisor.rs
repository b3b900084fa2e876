//! Multi-account lifecycle.
//!
//! The [`AccountSupervisor`] owns every account's record, log buffer, engine,
//! and window scheduler. It is the single writer of the account store and the
//! single consumer of engine events. All lifecycle operations serialize on one
//! registry lock, so an account is never half-replaced while another
//! operation looks at it.

use crate::scheduler::{SchedulerSettings, SchedulerStatus, WindowScheduler, WindowUpdate};
use chrono::TimeDelta;
use rc_core::clock::Clock;
use rc_core::config::{Config, PlatformConfig};
use rc_core::store::{AccountStore, StoreError};
use rc_core::types::{
    parse_time_of_day, validate_username, AccountId, AccountRecord, AuthMode, BeaconTable,
    Credentials, PublicAccount, ValidationError, DEFAULT_BEACON_KEY, DEFAULT_COOLDOWN_MS,
};
use rc_engine::client::{ClientError, SessionConnector};
use rc_engine::engine::{
    AccountEvent, AutoSignEngine, EngineContext, EngineControl, EngineSettings, EngineStatus,
};
use rc_telemetry::account_log::{AccountLogger, LogEntry, Notifier, DEFAULT_LOG_CAPACITY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("username {0} is already registered")]
    Duplicate(String),

    #[error("invite code is invalid or already used")]
    InvalidInvite,

    #[error("login failed: {0}")]
    Login(#[from] ClientError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Partial account configuration. Unset fields keep their stored value.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountUpdate {
    /// Target record for an operator upsert; ignored on owner updates.
    pub id: Option<AccountId>,
    pub username: Option<String>,
    pub auth_mode: Option<AuthMode>,
    pub password: Option<String>,
    pub cookie: Option<String>,
    pub beacon_key: Option<String>,
    pub cooldown_ms: Option<u64>,
    pub schedule_enabled: Option<bool>,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub log_empty_polls: Option<bool>,
    pub enabled: Option<bool>,
}

impl std::fmt::Debug for AccountUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountUpdate")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("auth_mode", &self.auth_mode)
            .field("has_password", &self.password.is_some())
            .field("has_cookie", &self.cookie.is_some())
            .field("beacon_key", &self.beacon_key)
            .finish_non_exhaustive()
    }
}

/// Self-service registration.
#[derive(Clone, Deserialize)]
pub struct InviteSignup {
    pub invite_code: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
}

/// Window change as sent by a front end, times in `HH:MM`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WindowRequest {
    pub start: Option<String>,
    pub end: Option<String>,
    pub enabled: Option<bool>,
}

impl WindowRequest {
    pub fn parse(&self) -> std::result::Result<WindowUpdate, ValidationError> {
        Ok(WindowUpdate {
            start: self.start.as_deref().map(parse_time_of_day).transpose()?,
            end: self.end.as_deref().map(parse_time_of_day).transpose()?,
            enabled: self.enabled,
        })
    }
}

/// Result of a manual start or stop.
///
/// `need_confirm` asks the caller to repeat the request with
/// `force_override` set; nothing changed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlOutcome {
    pub ok: bool,
    pub need_confirm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlOutcome {
    fn done() -> Self {
        Self {
            ok: true,
            need_confirm: false,
            message: None,
        }
    }

    fn confirm(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            need_confirm: true,
            message: Some(message.into()),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            need_confirm: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    #[serde(flatten)]
    pub account: PublicAccount,
    pub running: bool,
    /// False while the account waits for re-authorization.
    pub instantiated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub account: PublicAccount,
    pub engine: Option<EngineStatus>,
    pub scheduler: Option<SchedulerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Signup {
    pub account: PublicAccount,
    pub token: String,
}

// ---------------------------------------------------------------------------
// Settings and context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub scheduler: SchedulerSettings,
    pub batch_size: usize,
    /// Cooldown given to newly created accounts.
    pub default_cooldown_ms: u64,
    /// Minimum spacing between two auth-expiry notifications per account.
    pub auth_notify_interval: TimeDelta,
    pub log_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            batch_size: EngineSettings::default().batch_size,
            default_cooldown_ms: DEFAULT_COOLDOWN_MS,
            auth_notify_interval: TimeDelta::hours(24),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            scheduler: SchedulerSettings::from(&config.schedule),
            batch_size: config.engine.bruteforce_batch_size,
            default_cooldown_ms: config.engine.cooldown_ms,
            auth_notify_interval: i64::try_from(config.supervisor.auth_notify_interval_hours)
                .ok()
                .and_then(TimeDelta::try_hours)
                .unwrap_or(TimeDelta::MAX),
            log_capacity: config.supervisor.log_capacity,
        }
    }
}

/// Collaborators shared by every account.
#[derive(Clone)]
pub struct SupervisorContext {
    pub store: Arc<dyn AccountStore>,
    pub connector: Arc<dyn SessionConnector>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub platform: PlatformConfig,
    pub beacons: Arc<BeaconTable>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Live {
    engine: AutoSignEngine,
    scheduler: WindowScheduler,
}

impl Live {
    async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.engine.stop().await;
    }
}

/// One registered account. `live` is empty while credentials are missing.
struct Slot {
    record: AccountRecord,
    logger: Arc<AccountLogger>,
    live: Option<Live>,
}

type Registry = HashMap<AccountId, Slot>;

struct Pump {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// AccountSupervisor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AccountSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: SupervisorContext,
    settings: SupervisorSettings,
    slots: Mutex<Registry>,
    events_tx: flume::Sender<AccountEvent>,
    events_rx: flume::Receiver<AccountEvent>,
    pump: std::sync::Mutex<Option<Pump>>,
}

impl AccountSupervisor {
    pub fn new(ctx: SupervisorContext, settings: SupervisorSettings) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            inner: Arc::new(Inner {
                ctx,
                settings,
                slots: Mutex::new(HashMap::new()),
                events_tx,
                events_rx,
                pump: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Load every stored account, normalize records, and bring each one up.
    /// Returns the number of registered accounts.
    pub async fn init(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut records = inner.ctx.store.load_accounts().await?;

        let mut normalized = 0usize;
        for record in &mut records {
            let mut touched = false;
            if record.token.is_empty() {
                record.token = inner.ctx.store.issue_token();
                touched = true;
            }
            if inner.ctx.beacons.get(&record.beacon_key).is_none() {
                warn!(account_id = %record.id, beacon = %record.beacon_key, "unknown beacon reset to default");
                record.beacon_key = DEFAULT_BEACON_KEY.to_string();
                touched = true;
            }
            if record.cooldown_ms == 0 {
                record.cooldown_ms = inner.settings.default_cooldown_ms;
                touched = true;
            }
            normalized += usize::from(touched);
        }
        if normalized > 0 {
            inner.ctx.store.save_accounts(&records).await?;
            info!(normalized, "account records normalized");
        }

        self.start_event_pump();

        let mut slots = inner.slots.lock().await;
        for record in records {
            inner.ensure_instance(&mut slots, record, false).await?;
        }
        info!(accounts = slots.len(), "supervisor initialized");
        Ok(slots.len())
    }

    pub async fn list(&self) -> Vec<AccountSummary> {
        let slots = self.inner.slots.lock().await;
        let mut out: Vec<AccountSummary> = slots
            .values()
            .map(|slot| AccountSummary {
                account: slot.record.public_view(),
                running: slot.live.as_ref().is_some_and(|l| l.engine.is_running()),
                instantiated: slot.live.is_some(),
            })
            .collect();
        out.sort_by_key(|s| s.account.created_at);
        out
    }

    /// Create or replace an account and restart its instance.
    pub async fn upsert(&self, update: AccountUpdate) -> Result<PublicAccount> {
        let inner = &self.inner;
        let mut slots = inner.slots.lock().await;
        let mut records = inner.ctx.store.load_accounts().await?;
        let now = inner.ctx.clock.now_utc();

        let index = update
            .id
            .and_then(|id| records.iter().position(|r| r.id == id));
        let mut record = match index {
            Some(i) => records[i].clone(),
            None => {
                let username = update.username.clone().unwrap_or_default();
                validate_username(&username)?;
                let mut record = AccountRecord::new(
                    username,
                    update.auth_mode.unwrap_or_default(),
                    now,
                );
                if let Some(id) = update.id {
                    record.id = id;
                }
                record.cooldown_ms = inner.settings.default_cooldown_ms;
                record
            }
        };

        inner.apply_settings(&mut record, &update)?;
        if records
            .iter()
            .any(|r| r.id != record.id && r.username == record.username)
        {
            return Err(SupervisorError::Duplicate(record.username));
        }
        if let Some(mode) = update.auth_mode {
            record.auth_mode = mode;
        }
        inner.check_connector(record.auth_mode, false)?;
        if let Some(password) = non_empty(&update.password) {
            record.password_enc = Some(inner.ctx.store.encrypt_secret(password)?);
            record.auth_expired = false;
        }
        if let Some(cookie) = non_empty(&update.cookie) {
            record.cookie_enc = Some(inner.ctx.store.encrypt_secret(cookie)?);
            record.auth_expired = false;
        }
        if record.token.is_empty() {
            record.token = inner.ctx.store.issue_token();
        }
        record.updated_at = now;

        match index {
            Some(i) => records[i] = record.clone(),
            None => records.push(record.clone()),
        }
        inner.ctx.store.save_accounts(&records).await?;

        let id = record.id;
        let username = record.username.clone();
        inner.ensure_instance(&mut slots, record, true).await?;
        inner
            .ctx
            .notifier
            .control(&format!("Account {username} saved"))
            .await;
        public(&slots, id)
    }

    /// Register through a one-shot invite code. Returns the owner token.
    pub async fn create_via_invite(&self, signup: InviteSignup) -> Result<Signup> {
        let inner = &self.inner;
        validate_username(&signup.username)?;
        if signup.password.is_empty() {
            return Err(ValidationError::MissingCredential(signup.auth_mode).into());
        }
        if signup.invite_code.trim().is_empty() {
            return Err(SupervisorError::InvalidInvite);
        }
        inner.check_connector(signup.auth_mode, signup.auth_mode == AuthMode::CookieOnly)?;

        let mut slots = inner.slots.lock().await;
        let mut records = inner.ctx.store.load_accounts().await?;
        if records.iter().any(|r| r.username == signup.username) {
            return Err(SupervisorError::Duplicate(signup.username));
        }

        let now = inner.ctx.clock.now_utc();
        let mut record = AccountRecord::new(signup.username.clone(), signup.auth_mode, now);
        record.cooldown_ms = inner.settings.default_cooldown_ms;
        match signup.auth_mode {
            AuthMode::CookieOnly => {
                let cookie = inner
                    .ctx
                    .connector
                    .obtain_cookie(&signup.username, &signup.password)
                    .await?;
                record.cookie_enc = Some(inner.ctx.store.encrypt_secret(&cookie)?);
            }
            AuthMode::Password => {
                record.password_enc = Some(inner.ctx.store.encrypt_secret(&signup.password)?);
            }
        }

        // Consumed only once the credentials proved usable.
        if !inner.ctx.store.consume_invite(signup.invite_code.trim()).await? {
            return Err(SupervisorError::InvalidInvite);
        }
        record.token = inner.ctx.store.issue_token();
        records.push(record.clone());
        inner.ctx.store.save_accounts(&records).await?;

        let id = record.id;
        let token = record.token.clone();
        inner.ensure_instance(&mut slots, record, true).await?;
        inner
            .ctx
            .notifier
            .control(&format!(
                "New account {} registered by invite ({})",
                signup.username, signup.auth_mode
            ))
            .await;
        Ok(Signup {
            account: public(&slots, id)?,
            token,
        })
    }

    /// Stop the account's engine, then forget it.
    pub async fn delete(&self, id: AccountId) -> Result<()> {
        let inner = &self.inner;
        let mut slots = inner.slots.lock().await;
        let mut records = inner.ctx.store.load_accounts().await?;
        let stored = records.iter().position(|r| r.id == id);
        if stored.is_none() && !slots.contains_key(&id) {
            return Err(SupervisorError::NotFound(id.to_string()));
        }

        let username = match slots.remove(&id) {
            Some(slot) => {
                if let Some(live) = &slot.live {
                    live.shutdown().await;
                }
                slot.record.username
            }
            None => id.to_string(),
        };
        if let Some(i) = stored {
            records.remove(i);
            inner.ctx.store.save_accounts(&records).await?;
        }
        info!(account_id = %id, "account deleted");
        inner
            .ctx
            .notifier
            .control(&format!("Account {username} deleted"))
            .await;
        Ok(())
    }

    /// Start an engine by hand.
    ///
    /// Outside an active window this needs `force_override`; once forced the
    /// schedule leaves the engine alone until the window next opens.
    pub async fn start(&self, id: AccountId, force_override: bool) -> Result<ControlOutcome> {
        let slots = self.inner.slots.lock().await;
        let slot = slots
            .get(&id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        let Some(live) = &slot.live else {
            return Ok(ControlOutcome::failed(
                "Account needs re-authorization before it can run",
            ));
        };

        if live.scheduler.window().is_active() && !live.scheduler.is_currently_in_window() {
            if !force_override {
                slot.logger
                    .warn("Manual start requested outside the schedule window, waiting for confirmation")
                    .await;
                return Ok(ControlOutcome::confirm(
                    "Outside the schedule window. If confirmed, the engine keeps running until the window next opens, then the schedule takes over again.",
                ));
            }
            let pause = live.scheduler.pause_until_next_window_start();
            slot.logger
                .info(format!(
                    "Manual start confirmed, schedule paused until {}",
                    pause.until.format("%Y-%m-%d %H:%M")
                ))
                .await;
        }

        live.engine.start().await;
        if live.engine.is_running() {
            Ok(ControlOutcome::done())
        } else {
            Ok(ControlOutcome::failed(
                "Engine could not start, see the account log",
            ))
        }
    }

    /// Stop an engine by hand.
    ///
    /// Inside an active window this needs `force_override`; once forced the
    /// schedule keeps the engine stopped until tomorrow's window.
    pub async fn stop(&self, id: AccountId, force_override: bool) -> Result<ControlOutcome> {
        let slots = self.inner.slots.lock().await;
        let slot = slots
            .get(&id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        let Some(live) = &slot.live else {
            return Ok(ControlOutcome::done());
        };

        if live.scheduler.window().is_active() && live.scheduler.is_currently_in_window() {
            if !force_override {
                return Ok(ControlOutcome::confirm(
                    "Inside the schedule window. If confirmed, the engine stays stopped for the rest of today and the schedule resumes tomorrow.",
                ));
            }
            let pause = live.scheduler.pause_until_tomorrow();
            slot.logger
                .info(format!(
                    "Manual stop confirmed, schedule paused until {}",
                    pause.until.format("%Y-%m-%d %H:%M")
                ))
                .await;
        }

        live.engine.stop().await;
        Ok(ControlOutcome::done())
    }

    /// Change the schedule window in place and persist it.
    pub async fn update_window(&self, id: AccountId, request: &WindowRequest) -> Result<AccountStatus> {
        let update = request.parse()?;
        let inner = &self.inner;
        let mut slots = inner.slots.lock().await;
        let slot = slots
            .get_mut(&id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;

        let window = match &slot.live {
            Some(live) => live.scheduler.update_window(update).await,
            None => {
                let mut window = slot.record.schedule;
                update.apply(&mut window);
                window
            }
        };
        slot.record.schedule = window;
        slot.record.updated_at = inner.ctx.clock.now_utc();
        let record = slot.record.clone();
        inner.persist(&record).await?;
        Ok(status_of(slot))
    }

    pub async fn status(&self, id: AccountId) -> Result<AccountStatus> {
        let slots = self.inner.slots.lock().await;
        slots
            .get(&id)
            .map(status_of)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    pub async fn logs(&self, id: AccountId, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let slots = self.inner.slots.lock().await;
        slots
            .get(&id)
            .map(|slot| slot.logger.recent(limit))
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    pub async fn clear_logs(&self, id: AccountId) -> Result<()> {
        let slots = self.inner.slots.lock().await;
        let slot = slots
            .get(&id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        slot.logger.clear();
        Ok(())
    }

    // -- Owner access -------------------------------------------------------

    /// Resolve an owner token to its account.
    pub async fn account_for_token(&self, token: &str) -> Result<AccountId> {
        let slots = self.inner.slots.lock().await;
        find_by_token(&slots, token)
    }

    /// Status for the owner, including the decrypted stored password.
    pub async fn status_by_token(&self, token: &str) -> Result<AccountStatus> {
        let slots = self.inner.slots.lock().await;
        let id = find_by_token(&slots, token)?;
        let slot = slots
            .get(&id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        let mut status = status_of(slot);
        if let Some(sealed) = slot.record.password_enc.as_deref() {
            match self.inner.ctx.store.decrypt_secret(sealed) {
                Ok(password) => status.account.password = Some(password),
                Err(e) => warn!(account_id = %id, error = %e, "stored password could not be decrypted"),
            }
        }
        Ok(status)
    }

    /// Owner-side reconfiguration.
    ///
    /// Switching to cookie-only needs the password once, to obtain a cookie;
    /// the stored password is then dropped. Switching to password mode needs
    /// a password unless one is already stored.
    pub async fn update_by_token(&self, token: &str, update: AccountUpdate) -> Result<PublicAccount> {
        let inner = &self.inner;
        let mut slots = inner.slots.lock().await;
        let id = find_by_token(&slots, token)?;
        let mut records = inner.ctx.store.load_accounts().await?;
        let index = records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        let mut record = records[index].clone();

        let password = non_empty(&update.password);
        let mode = update.auth_mode.unwrap_or(record.auth_mode);
        if mode != record.auth_mode {
            let missing = match mode {
                AuthMode::CookieOnly => password.is_none(),
                AuthMode::Password => password.is_none() && record.password_enc.is_none(),
            };
            if missing {
                return Err(ValidationError::MissingCredential(mode).into());
            }
        }
        inner.check_connector(mode, mode == AuthMode::CookieOnly && password.is_some())?;

        inner.apply_settings(&mut record, &update)?;
        if records
            .iter()
            .any(|r| r.id != record.id && r.username == record.username)
        {
            return Err(SupervisorError::Duplicate(record.username));
        }
        if let Some(password) = password {
            match mode {
                AuthMode::CookieOnly => {
                    let cookie = inner
                        .ctx
                        .connector
                        .obtain_cookie(&record.username, password)
                        .await?;
                    record.cookie_enc = Some(inner.ctx.store.encrypt_secret(&cookie)?);
                    record.password_enc = None;
                }
                AuthMode::Password => {
                    record.password_enc = Some(inner.ctx.store.encrypt_secret(password)?);
                }
            }
            record.auth_expired = false;
        }
        record.auth_mode = mode;
        record.updated_at = inner.ctx.clock.now_utc();

        records[index] = record.clone();
        inner.ctx.store.save_accounts(&records).await?;
        inner.ensure_instance(&mut slots, record, true).await?;
        public(&slots, id)
    }

    pub async fn start_by_token(&self, token: &str, force_override: bool) -> Result<ControlOutcome> {
        let id = self.account_for_token(token).await?;
        self.start(id, force_override).await
    }

    pub async fn stop_by_token(&self, token: &str, force_override: bool) -> Result<ControlOutcome> {
        let id = self.account_for_token(token).await?;
        self.stop(id, force_override).await
    }

    pub async fn update_window_by_token(&self, token: &str, request: &WindowRequest) -> Result<AccountStatus> {
        let id = self.account_for_token(token).await?;
        self.update_window(id, request).await
    }

    pub async fn logs_by_token(&self, token: &str, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let id = self.account_for_token(token).await?;
        self.logs(id, limit).await
    }

    pub async fn clear_logs_by_token(&self, token: &str) -> Result<()> {
        let id = self.account_for_token(token).await?;
        self.clear_logs(id).await
    }

    // -- Events -------------------------------------------------------------

    /// Apply one engine event to its account record.
    ///
    /// Events from an engine that has since been replaced are dropped.
    /// Expiry notifications are throttled per account.
    pub async fn handle_event(&self, event: AccountEvent) {
        let inner = &self.inner;
        let mut slots = inner.slots.lock().await;
        let id = event.account_id();
        let Some(slot) = slots.get_mut(&id) else {
            debug!(account_id = %id, "event for unknown account dropped");
            return;
        };
        let current = slot.live.as_ref().map(|l| l.engine.instance());
        if current != Some(event.instance()) {
            debug!(account_id = %id, instance = event.instance(), "event from a replaced engine dropped");
            return;
        }

        let now = inner.ctx.clock.now_utc();
        match event {
            AccountEvent::AuthExpired { reason, .. } => {
                slot.record.auth_expired = true;
                slot.record.last_auth_fail_at = Some(now);
                let due = slot
                    .record
                    .last_notify_at
                    .is_none_or(|last| now - last >= inner.settings.auth_notify_interval);
                if due {
                    slot.record.last_notify_at = Some(now);
                    slot.logger
                        .warn(format!(
                            "Authorization for {} has expired, please re-authorize ({reason})",
                            slot.record.username
                        ))
                        .await;
                } else {
                    debug!(account_id = %id, "auth expiry notification throttled");
                }
            }
            AccountEvent::AuthRecovered { .. } => {
                slot.record.auth_expired = false;
                slot.record.last_auth_fail_at = None;
                info!(account_id = %id, "authorization recovered");
            }
        }

        let record = slot.record.clone();
        if let Err(e) = inner.persist(&record).await {
            warn!(account_id = %id, error = %e, "failed to persist account state");
        }
    }

    fn start_event_pump(&self) {
        let mut pump = self.inner.pump.lock().unwrap_or_else(|e| e.into_inner());
        if pump.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let events = self.inner.events_rx.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = async { let _ = stop_rx.wait_for(|stopped| *stopped).await; } => break,
                    event = events.recv_async() => match event {
                        Ok(event) => this.handle_event(event).await,
                        Err(_) => break,
                    },
                }
            }
            debug!("event pump stopped");
        });
        *pump = Some(Pump { stop_tx, handle });
    }

    /// Stop every scheduler and engine, then apply the events they left.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let slots = inner.slots.lock().await;
            for slot in slots.values() {
                if let Some(live) = &slot.live {
                    live.shutdown().await;
                }
            }
        }

        let pump = inner.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            pump.stop_tx.send_replace(true);
            if let Err(e) = pump.handle.await {
                warn!(error = %e, "event pump panicked");
            }
        }
        while let Ok(event) = inner.events_rx.try_recv() {
            self.handle_event(event).await;
        }

        let mut slots = inner.slots.lock().await;
        for slot in slots.values_mut() {
            slot.live = None;
        }
        info!(accounts = slots.len(), "supervisor shut down");
    }
}

impl Inner {
    /// Bring an account up, replacing a running instance when `restart` is
    /// set. The previous engine is fully drained before the new one exists.
    /// Rejects auth modes the connector cannot serve. `exchange` is set when
    /// a password has to be traded for a cookie.
    fn check_connector(&self, mode: AuthMode, exchange: bool) -> std::result::Result<(), ValidationError> {
        let connector = &self.ctx.connector;
        if !connector.supports(mode) || (exchange && !connector.can_obtain_cookie()) {
            return Err(ValidationError::UnsupportedAuthMode(mode));
        }
        Ok(())
    }

    async fn ensure_instance(&self, slots: &mut Registry, mut record: AccountRecord, restart: bool) -> Result<()> {
        let id = record.id;
        let (logger, previous) = match slots.remove(&id) {
            Some(slot) if slot.live.is_some() && !restart => {
                slots.insert(id, slot);
                return Ok(());
            }
            Some(slot) => (slot.logger, slot.live),
            None => (
                Arc::new(AccountLogger::new(
                    record.username.clone(),
                    self.settings.log_capacity,
                    self.ctx.notifier.clone(),
                )),
                None,
            ),
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
            debug!(account_id = %id, "previous instance drained");
        }

        let credentials = if self.ctx.connector.supports(record.auth_mode) {
            self.credentials_for(&record)
        } else {
            None
        };
        let Some(credentials) = credentials else {
            logger
                .warn(format!(
                    "No usable {} credential stored, please re-authorize",
                    record.auth_mode
                ))
                .await;
            record.auth_expired = true;
            slots.insert(
                id,
                Slot {
                    record: record.clone(),
                    logger,
                    live: None,
                },
            );
            return self.persist(&record).await;
        };

        let engine = AutoSignEngine::new(
            id,
            credentials,
            EngineContext {
                connector: self.ctx.connector.clone(),
                platform: self.ctx.platform.clone(),
                beacons: self.ctx.beacons.clone(),
                events: self.events_tx.clone(),
            },
            EngineSettings {
                cooldown: Duration::from_millis(record.cooldown_ms),
                log_empty_polls: record.log_empty_polls,
                preferred_beacon: Some(record.beacon_key.clone()),
                batch_size: self.settings.batch_size,
            },
            logger.clone(),
        );
        let scheduler = WindowScheduler::new(
            Arc::new(engine.clone()),
            self.ctx.clock.clone(),
            record.schedule,
            self.settings.scheduler,
        );
        scheduler.start();
        if record.enabled && !record.schedule.is_active() {
            engine.start().await;
        }
        info!(account_id = %id, username = %record.username, mode = %record.auth_mode, "account instance ready");

        slots.insert(
            id,
            Slot {
                record,
                logger,
                live: Some(Live { engine, scheduler }),
            },
        );
        Ok(())
    }

    /// Decrypt the credential matching the record's mode.
    fn credentials_for(&self, record: &AccountRecord) -> Option<Credentials> {
        let sealed = match record.auth_mode {
            AuthMode::Password => record.password_enc.as_deref(),
            AuthMode::CookieOnly => record.cookie_enc.as_deref(),
        }?;
        let secret = match self.ctx.store.decrypt_secret(sealed) {
            Ok(secret) if !secret.is_empty() => secret,
            Ok(_) => return None,
            Err(e) => {
                warn!(account_id = %record.id, error = %e, "stored credential could not be decrypted");
                return None;
            }
        };
        let username = record.username.clone();
        Some(match record.auth_mode {
            AuthMode::Password => Credentials::Password {
                username,
                password: secret,
            },
            AuthMode::CookieOnly => Credentials::Cookie {
                username,
                cookie: secret,
            },
        })
    }

    /// Validate and apply the non-credential fields of an update.
    fn apply_settings(&self, record: &mut AccountRecord, update: &AccountUpdate) -> Result<()> {
        if let Some(username) = &update.username {
            validate_username(username)?;
            record.username = username.clone();
        }
        if let Some(key) = &update.beacon_key {
            self.ctx.beacons.validate_key(key)?;
            record.beacon_key = key.clone();
        }
        if let Some(ms) = update.cooldown_ms.filter(|ms| *ms > 0) {
            record.cooldown_ms = ms;
        }
        if let Some(start) = &update.window_start {
            record.schedule.start = parse_time_of_day(start)?;
        }
        if let Some(end) = &update.window_end {
            record.schedule.end = parse_time_of_day(end)?;
        }
        if let Some(enabled) = update.schedule_enabled {
            record.schedule.enabled = enabled;
        }
        if let Some(log) = update.log_empty_polls {
            record.log_empty_polls = log;
        }
        if let Some(enabled) = update.enabled {
            record.enabled = enabled;
        }
        Ok(())
    }

    /// Merge one record into the stored set.
    async fn persist(&self, record: &AccountRecord) -> Result<()> {
        let mut records = self.ctx.store.load_accounts().await?;
        let Some(stored) = records.iter_mut().find(|r| r.id == record.id) else {
            debug!(account_id = %record.id, "record no longer stored, not persisted");
            return Ok(());
        };
        *stored = record.clone();
        self.ctx.store.save_accounts(&records).await?;
        Ok(())
    }
}

fn public(slots: &Registry, id: AccountId) -> Result<PublicAccount> {
    slots
        .get(&id)
        .map(|slot| slot.record.public_view())
        .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
}

fn status_of(slot: &Slot) -> AccountStatus {
    AccountStatus {
        account: slot.record.public_view(),
        engine: slot.live.as_ref().map(|l| l.engine.status()),
        scheduler: slot.live.as_ref().map(|l| l.scheduler.status()),
    }
}

fn find_by_token(slots: &Registry, token: &str) -> Result<AccountId> {
    if token.is_empty() {
        return Err(SupervisorError::NotFound("empty token".into()));
    }
    slots
        .values()
        .find(|slot| slot.record.token == token)
        .map(|slot| slot.record.id)
        .ok_or_else(|| SupervisorError::NotFound("unknown token".into()))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
