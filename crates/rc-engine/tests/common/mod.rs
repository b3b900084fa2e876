#![allow(dead_code)]

use async_trait::async_trait;
use rc_core::types::{BeaconTable, Credentials};
use rc_engine::client::{
    AuthenticatedHttpClient, ClientError, PlatformRequest, PlatformResponse, SessionConnector,
};
use rc_engine::geolocation::great_circle_distance;
use rc_telemetry::account_log::{AccountLogger, RecordingNotifier};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Radius around the true position inside which a radar answer is accepted.
pub const ACCEPT_RADIUS_M: f64 = 50.0;

/// Scripted course platform.
pub struct FakePlatform {
    /// Where the instructor's device is.
    pub device: Mutex<Option<(f64, f64)>>,
    /// Whether rejected radar answers carry a distance.
    pub report_distance: AtomicBool,
    pub correct_code: Mutex<Option<u16>>,
    pub number_delay: Mutex<Duration>,
    pub rollcalls: Mutex<serde_json::Value>,
    /// Every request answers 401 while set.
    pub expired: AtomicBool,
    /// The next fetch answers a login redirect, then the flag clears.
    pub expire_next_fetch: AtomicBool,
    pub fetches: AtomicUsize,
    pub number_calls: AtomicUsize,
    pub radar_calls: Mutex<Vec<(f64, f64)>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            device: Mutex::new(None),
            report_distance: AtomicBool::new(true),
            correct_code: Mutex::new(None),
            number_delay: Mutex::new(Duration::ZERO),
            rollcalls: Mutex::new(json!({ "rollcalls": [] })),
            expired: AtomicBool::new(false),
            expire_next_fetch: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            number_calls: AtomicUsize::new(0),
            radar_calls: Mutex::new(Vec::new()),
        })
    }

    pub fn with_device(self: Arc<Self>, lon: f64, lat: f64) -> Arc<Self> {
        *self.device.lock().unwrap() = Some((lon, lat));
        self
    }

    pub fn with_code(self: Arc<Self>, code: u16) -> Arc<Self> {
        *self.correct_code.lock().unwrap() = Some(code);
        self
    }

    pub fn with_number_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.number_delay.lock().unwrap() = delay;
        self
    }

    pub fn set_rollcalls(&self, rollcalls: serde_json::Value) {
        *self.rollcalls.lock().unwrap() = json!({ "rollcalls": rollcalls });
    }

    pub fn radar_call_count(&self) -> usize {
        self.radar_calls.lock().unwrap().len()
    }

    fn answer_radar(&self, body: &serde_json::Value) -> PlatformResponse {
        let lon = body["longitude"].as_f64().unwrap_or(f64::NAN);
        let lat = body["latitude"].as_f64().unwrap_or(f64::NAN);
        self.radar_calls.lock().unwrap().push((lon, lat));

        let Some((dlon, dlat)) = *self.device.lock().unwrap() else {
            return PlatformResponse::json(400, json!({ "status_name": "absent" }));
        };
        let distance = great_circle_distance(lon, lat, dlon, dlat).unwrap_or(f64::MAX);
        if distance <= ACCEPT_RADIUS_M {
            PlatformResponse::json(200, json!({ "status_name": "on_call_fine" }))
        } else if self.report_distance.load(Ordering::SeqCst) {
            PlatformResponse::json(
                400,
                json!({ "error_code": "radar_out_of_range", "data": { "distance": distance } }),
            )
        } else {
            PlatformResponse::json(400, json!({ "error_code": "radar_out_of_range" }))
        }
    }

    async fn answer_number(&self, body: &serde_json::Value) -> PlatformResponse {
        self.number_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.number_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let code = body["numberCode"]
            .as_str()
            .and_then(|c| c.parse::<u16>().ok());
        if code.is_some() && code == *self.correct_code.lock().unwrap() {
            PlatformResponse::json(200, json!({ "status": "on_call" }))
        } else {
            PlatformResponse::json(400, json!({ "error_code": "wrong_number_code" }))
        }
    }
}

#[async_trait]
impl AuthenticatedHttpClient for FakePlatform {
    async fn send(&self, request: PlatformRequest) -> Result<PlatformResponse, ClientError> {
        if self.expired.load(Ordering::SeqCst) {
            return Ok(PlatformResponse::json(401, json!({})));
        }
        let body = request.body.clone().unwrap_or_default();
        if request.path == "/api/radar/rollcalls" {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.expire_next_fetch.swap(false, Ordering::SeqCst) {
                return Ok(PlatformResponse::redirect(
                    302,
                    "https://identity.zju.edu.cn/cas/login?service=courses",
                ));
            }
            return Ok(PlatformResponse::json(
                200,
                self.rollcalls.lock().unwrap().clone(),
            ));
        }
        if request.path.contains("/answer_number_rollcall") {
            return Ok(self.answer_number(&body).await);
        }
        if request.path.contains("/answer?api_version=") {
            return Ok(self.answer_radar(&body));
        }
        Ok(PlatformResponse::json(404, json!({})))
    }
}

/// Hands out the same fake platform for every connection.
pub struct FakeConnector {
    pub platform: Arc<FakePlatform>,
    pub connects: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeConnector {
    pub fn new(platform: Arc<FakePlatform>) -> Arc<Self> {
        Arc::new(Self {
            platform,
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn AuthenticatedHttpClient>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("identity provider unreachable".into()));
        }
        Ok(self.platform.clone())
    }

    async fn obtain_cookie(&self, username: &str, _password: &str) -> Result<String, ClientError> {
        Ok(format!("session={username}"))
    }
}

pub fn logger() -> (Arc<AccountLogger>, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    (
        Arc::new(AccountLogger::new("3200100001", 500, notifier.clone())),
        notifier,
    )
}

pub fn beacons() -> Arc<BeaconTable> {
    Arc::new(BeaconTable::campus_default())
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
