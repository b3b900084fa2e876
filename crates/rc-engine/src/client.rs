//! Course platform access.
//!
//! [`AuthenticatedHttpClient`] is the transport seam: one `send` that attaches
//! session material. [`PlatformApi`] sits on top and routes every call
//! through a single classifying request function, so auth expiry looks the
//! same no matter which endpoint noticed it.

use async_trait::async_trait;
use rc_core::config::PlatformConfig;
use rc_core::types::{AuthMode, Credentials, Rollcall, RollcallId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Accuracy reported with every radar answer, in metres.
const RADAR_ACCURACY: u32 = 68;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// The session is no longer accepted by the platform.
    #[error("auth expired: {0}")]
    AuthExpired(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ClientError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ClientError::AuthExpired(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Transport("request timed out".into())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformRequest {
    pub method: Method,
    /// Path and query, relative to the platform base URL.
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl PlatformRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Put,
            path: path.into(),
            body: Some(body),
        }
    }
}

/// Raw response. Redirects are never followed, so `location` is visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

impl PlatformResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            location: None,
            body: body.to_string(),
        }
    }

    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self {
            status,
            location: Some(location.into()),
            body: String::new(),
        }
    }
}

#[async_trait]
pub trait AuthenticatedHttpClient: Send + Sync {
    async fn send(&self, request: PlatformRequest) -> Result<PlatformResponse>;
}

/// Builds authenticated clients from credentials.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn AuthenticatedHttpClient>>;

    /// Log in once with a password and return only the resulting cookie.
    async fn obtain_cookie(&self, username: &str, password: &str) -> Result<String>;

    /// Whether [`connect`](Self::connect) accepts credentials of `mode`.
    fn supports(&self, mode: AuthMode) -> bool {
        let _ = mode;
        true
    }

    /// Whether [`obtain_cookie`](Self::obtain_cookie) is implemented.
    fn can_obtain_cookie(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// CookieSessionClient
// ---------------------------------------------------------------------------

/// Sends requests with a fixed session cookie.
pub struct CookieSessionClient {
    client: reqwest::Client,
    base_url: String,
    cookie: String,
    user_agent: String,
}

impl std::fmt::Debug for CookieSessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSessionClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CookieSessionClient {
    pub fn new(config: &PlatformConfig, cookie: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            cookie: cookie.into(),
            user_agent: config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl AuthenticatedHttpClient for CookieSessionClient {
    async fn send(&self, request: PlatformRequest) -> Result<PlatformResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut req = match request.method {
            Method::Get => self.client.get(&url),
            Method::Put => self.client.put(&url),
        }
        .header(reqwest::header::COOKIE, &self.cookie)
        .header(reqwest::header::USER_AGENT, &self.user_agent);
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;
        Ok(PlatformResponse {
            status,
            location,
            body,
        })
    }
}

/// Connector for sessions that are already established.
///
/// Cookie credentials become a [`CookieSessionClient`]. Password login is a
/// separate protocol; this connector rejects password credentials, so
/// password-mode accounts need a connector that implements it.
#[derive(Debug, Clone)]
pub struct CookieConnector {
    config: PlatformConfig,
}

impl CookieConnector {
    pub fn new(config: PlatformConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for CookieConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn AuthenticatedHttpClient>> {
        match credentials {
            Credentials::Cookie { cookie, .. } => {
                Ok(Arc::new(CookieSessionClient::new(&self.config, cookie.clone())?))
            }
            Credentials::Password { .. } => Err(ClientError::Unsupported(
                "password login is not available with the cookie connector".into(),
            )),
        }
    }

    async fn obtain_cookie(&self, _username: &str, _password: &str) -> Result<String> {
        Err(ClientError::Unsupported(
            "password login is not available with the cookie connector".into(),
        ))
    }

    fn supports(&self, mode: AuthMode) -> bool {
        mode == AuthMode::CookieOnly
    }

    fn can_obtain_cookie(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// PlatformApi
// ---------------------------------------------------------------------------

/// What the platform said about one radar submission.
#[derive(Debug, Clone, PartialEq)]
pub struct RadarOutcome {
    pub on_call: bool,
    pub distance: Option<f64>,
    pub raw: serde_json::Value,
}

#[derive(Deserialize)]
struct RollcallList {
    #[serde(default)]
    rollcalls: Vec<Rollcall>,
}

pub struct PlatformApi {
    client: Arc<dyn AuthenticatedHttpClient>,
    identity_host: String,
    answer_api_version: String,
}

impl PlatformApi {
    pub fn new(client: Arc<dyn AuthenticatedHttpClient>, config: &PlatformConfig) -> Self {
        Self {
            client,
            identity_host: config.identity_host.clone(),
            answer_api_version: config.answer_api_version.clone(),
        }
    }

    /// The one place responses are classified.
    ///
    /// 401/403 and redirects towards the identity host or a login page mean
    /// the session expired. Any other status is returned to the caller.
    async fn request(&self, request: PlatformRequest) -> Result<PlatformResponse> {
        let path = request.path.clone();
        let resp = self.client.send(request).await?;

        if resp.status == 401 || resp.status == 403 {
            return Err(ClientError::AuthExpired(format!("status {}", resp.status)));
        }
        if (300..400).contains(&resp.status) {
            let location = resp.location.as_deref().unwrap_or("");
            if location.contains(&self.identity_host) || location.contains("login") {
                tracing::debug!(
                    status = resp.status,
                    location = %location.chars().take(100).collect::<String>(),
                    %path,
                    "redirected to sign-on"
                );
                return Err(ClientError::AuthExpired(format!(
                    "redirect to sign-on ({})",
                    resp.status
                )));
            }
        }
        Ok(resp)
    }

    pub async fn fetch_rollcalls(&self) -> Result<Vec<Rollcall>> {
        let resp = self
            .request(PlatformRequest::get("/api/radar/rollcalls"))
            .await?;
        if !(200..300).contains(&resp.status) {
            return Err(ClientError::Transport(format!(
                "rollcall list returned status {}",
                resp.status
            )));
        }
        let list: RollcallList = serde_json::from_str(&resp.body)
            .map_err(|e| ClientError::Decode(format!("{e}: {}", snippet(&resp.body))))?;
        Ok(list.rollcalls)
    }

    pub async fn answer_radar(
        &self,
        rollcall_id: RollcallId,
        longitude: f64,
        latitude: f64,
    ) -> Result<RadarOutcome> {
        let body = serde_json::json!({
            "deviceId": Uuid::new_v4().to_string(),
            "latitude": latitude,
            "longitude": longitude,
            "speed": null,
            "accuracy": RADAR_ACCURACY,
            "altitude": null,
            "altitudeAccuracy": null,
            "heading": null,
        });
        let path = format!(
            "/api/rollcall/{rollcall_id}/answer?api_version={}",
            self.answer_api_version
        );
        let resp = self.request(PlatformRequest::put(path, body)).await?;

        // Rejections still carry a JSON body with the distance.
        let raw: serde_json::Value =
            serde_json::from_str(&resp.body).unwrap_or(serde_json::Value::Null);
        Ok(RadarOutcome {
            on_call: raw.get("status_name").and_then(|v| v.as_str()) == Some("on_call_fine"),
            distance: extract_distance(&raw),
            raw,
        })
    }

    /// `true` when `code` was accepted.
    pub async fn answer_number(&self, rollcall_id: RollcallId, code: u16) -> Result<bool> {
        let body = serde_json::json!({
            "deviceId": Uuid::new_v4().to_string(),
            "numberCode": format!("{code:04}"),
        });
        let path = format!("/api/rollcall/{rollcall_id}/answer_number_rollcall");
        let resp = self.request(PlatformRequest::put(path, body)).await?;
        if resp.status != 200 {
            return Ok(false);
        }
        let wrong = serde_json::from_str::<serde_json::Value>(&resp.body)
            .ok()
            .and_then(|v| v.get("error_code").and_then(|c| c.as_str()).map(|c| c.contains("wrong")))
            .unwrap_or(false);
        Ok(!wrong)
    }
}

/// Distance in metres from `distance`, `data.distance` or `result.distance`.
///
/// Numbers and numeric strings are accepted; zero, negative and non-finite
/// values are not.
pub fn extract_distance(outcome: &serde_json::Value) -> Option<f64> {
    let candidates = [
        outcome.get("distance"),
        outcome.get("data").and_then(|d| d.get("distance")),
        outcome.get("result").and_then(|r| r.get("distance")),
    ];
    candidates.into_iter().flatten().find_map(|v| {
        let n = match v {
            serde_json::Value::Number(n) => n.as_f64()?,
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        (n.is_finite() && n > 0.0).then_some(n)
    })
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
