#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rc_core::clock::ManualClock;
use rc_core::config::PlatformConfig;
use rc_core::store::{AccountStore, MemoryStore};
use rc_core::types::{AccountRecord, AuthMode, BeaconTable, Credentials, ScheduleWindow};
use rc_daemon::scheduler::SchedulerSettings;
use rc_daemon::supervisor::{AccountSupervisor, SupervisorContext, SupervisorSettings};
use rc_engine::client::{
    AuthenticatedHttpClient, ClientError, PlatformRequest, PlatformResponse, SessionConnector,
};
use rc_engine::engine::EngineControl;
use rc_telemetry::account_log::RecordingNotifier;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

pub fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

pub fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
}

pub fn day_window() -> ScheduleWindow {
    ScheduleWindow::new(hm(8, 0), hm(22, 0), true)
}

/// Poll `cond` every 10 ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

/// Start/stop recorder for scheduler tests.
#[derive(Default)]
pub struct FakeEngine {
    pub running: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Delay inside `start`, to hold a transition open.
    pub start_delay: Mutex<Duration>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl EngineControl for FakeEngine {
    async fn start(&self) {
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Fake platform sessions
// ---------------------------------------------------------------------------

/// One platform session, labelled with the secret it was built from.
pub struct FakeSession {
    label: String,
    shared: Arc<Shared>,
}

#[derive(Default)]
pub struct Shared {
    /// `begin <label>` / `end <label>` for every rollcall fetch.
    pub journal: Mutex<Vec<String>>,
    pub fetch_delay: Mutex<Duration>,
    /// Every request answers 401 while set.
    pub expired: AtomicBool,
    /// The next fetch answers 401, then the flag clears.
    pub expire_once: AtomicBool,
}

#[async_trait]
impl AuthenticatedHttpClient for FakeSession {
    async fn send(&self, request: PlatformRequest) -> Result<PlatformResponse, ClientError> {
        if self.shared.expired.load(Ordering::SeqCst)
            || self.shared.expire_once.swap(false, Ordering::SeqCst)
        {
            return Ok(PlatformResponse::json(401, json!({})));
        }
        if request.path == "/api/radar/rollcalls" {
            self.shared.journal.lock().unwrap().push(format!("begin {}", self.label));
            let delay = *self.shared.fetch_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.shared.journal.lock().unwrap().push(format!("end {}", self.label));
            return Ok(PlatformResponse::json(200, json!({ "rollcalls": [] })));
        }
        Ok(PlatformResponse::json(404, json!({})))
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub shared: Arc<Shared>,
    pub connects: AtomicUsize,
    /// Password logins are rejected while set.
    pub reject_login: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn journal(&self) -> Vec<String> {
        self.shared.journal.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn AuthenticatedHttpClient>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let label = match credentials {
            Credentials::Cookie { cookie, .. } => cookie.clone(),
            Credentials::Password { password, .. } => password.clone(),
        };
        Ok(Arc::new(FakeSession {
            label,
            shared: self.shared.clone(),
        }))
    }

    async fn obtain_cookie(&self, username: &str, _password: &str) -> Result<String, ClientError> {
        if self.reject_login.load(Ordering::SeqCst) {
            return Err(ClientError::AuthExpired("login rejected".into()));
        }
        Ok(format!("cookie-for-{username}"))
    }
}

// ---------------------------------------------------------------------------
// Supervisor harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub supervisor: AccountSupervisor,
    pub store: Arc<MemoryStore>,
    pub connector: Arc<FakeConnector>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn record(&self, username: &str) -> AccountRecord {
        self.store
            .records()
            .into_iter()
            .find(|r| r.username == username)
            .unwrap()
    }

    pub fn open(&self, sealed: &str) -> String {
        self.store.decrypt_secret(sealed).unwrap()
    }
}

/// Records are built against the store so their secrets can be sealed.
pub struct Seed {
    pub store: MemoryStore,
}

impl Seed {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new().unwrap(),
        }
    }

    pub fn cookie_account(&self, username: &str, cookie: &str, schedule: ScheduleWindow) -> AccountRecord {
        let mut record = AccountRecord::new(username, AuthMode::CookieOnly, chrono::Utc::now());
        record.cookie_enc = Some(self.store.encrypt_secret(cookie).unwrap());
        record.schedule = schedule;
        record.cooldown_ms = 20;
        record.token = format!("token-{username}");
        record
    }

    pub fn password_account(&self, username: &str, password: &str, schedule: ScheduleWindow) -> AccountRecord {
        let mut record = AccountRecord::new(username, AuthMode::Password, chrono::Utc::now());
        record.password_enc = Some(self.store.encrypt_secret(password).unwrap());
        record.schedule = schedule;
        record.cooldown_ms = 20;
        record.token = format!("token-{username}");
        record
    }
}

pub fn settings() -> SupervisorSettings {
    SupervisorSettings {
        scheduler: SchedulerSettings {
            tick: Duration::from_secs(3600),
            transition_delay: Duration::ZERO,
        },
        default_cooldown_ms: 20,
        ..Default::default()
    }
}

pub fn harness(
    seed: Seed,
    records: Vec<AccountRecord>,
    invites: &[&str],
    now: NaiveDateTime,
) -> Harness {
    let store = Arc::new(
        seed.store
            .with_records(records)
            .with_invites(invites.iter().map(|s| s.to_string())),
    );
    let connector = FakeConnector::new();
    let notifier = Arc::new(RecordingNotifier::new());
    let clock = Arc::new(ManualClock::new(now));
    let supervisor = AccountSupervisor::new(
        SupervisorContext {
            store: store.clone(),
            connector: connector.clone(),
            notifier: notifier.clone(),
            clock: clock.clone(),
            platform: PlatformConfig::default(),
            beacons: Arc::new(BeaconTable::campus_default()),
        },
        settings(),
    );
    Harness {
        supervisor,
        store,
        connector,
        notifier,
        clock,
    }
}
