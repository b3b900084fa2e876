use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a registered account.
pub type AccountId = Uuid;

/// Identifier of a rollcall on the remote platform.
pub type RollcallId = i64;

/// Default poll cooldown between two rollcall fetches.
pub const DEFAULT_COOLDOWN_MS: u64 = 4_000;

/// Beacon tried first when an account has not chosen one.
pub const DEFAULT_BEACON_KEY: &str = "ZJGD1";

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Configuration values rejected at the control-surface boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid username `{0}`: expected a 10-digit student number")]
    InvalidUsername(String),

    #[error("unknown beacon key `{0}`")]
    UnknownBeacon(String),

    #[error("invalid time of day `{0}`: expected HH:MM")]
    InvalidTime(String),

    #[error("auth mode {0} requires a credential that was not supplied")]
    MissingCredential(AuthMode),

    #[error("invalid auth mode `{0}`")]
    InvalidAuthMode(String),

    #[error("auth mode {0} needs password login, which is not available here")]
    UnsupportedAuthMode(AuthMode),
}

/// Usernames are 10-digit student numbers.
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username.len() == 10 && username.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::InvalidUsername(username.to_string()))
    }
}

/// Parse an `HH:MM` time of day.
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ValidationError::InvalidTime(raw.to_string()))
}

// ---------------------------------------------------------------------------
// AuthMode
// ---------------------------------------------------------------------------

/// Credential strategy for an account.
///
/// `Password` keeps the (encrypted) password and can log in again on its
/// own. `CookieOnly` keeps a session cookie obtained once from the password;
/// the password is discarded, so an expired cookie needs the owner to
/// re-authorize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    #[serde(alias = "password_persist")]
    Password,
    #[serde(alias = "secure_cookie")]
    CookieOnly,
}

impl AuthMode {
    /// Whether an engine in this mode can re-establish its own session.
    pub fn can_self_refresh(&self) -> bool {
        matches!(self, AuthMode::Password)
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw {
            "password" | "password_persist" => Ok(AuthMode::Password),
            "cookie_only" | "secure_cookie" => Ok(AuthMode::CookieOnly),
            other => Err(ValidationError::InvalidAuthMode(other.to_string())),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthMode::Password => "password",
            AuthMode::CookieOnly => "cookie_only",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Decrypted credential material handed to a session connector.
///
/// Exactly one kind is present, matching the account's [`AuthMode`].
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { username: String, password: String },
    Cookie { username: String, cookie: String },
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Credentials::Password { username, .. } | Credentials::Cookie { username, .. } => {
                username
            }
        }
    }

    pub fn auth_mode(&self) -> AuthMode {
        match self {
            Credentials::Password { .. } => AuthMode::Password,
            Credentials::Cookie { .. } => AuthMode::CookieOnly,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username())
            .field("auth_mode", &self.auth_mode())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ScheduleWindow
// ---------------------------------------------------------------------------

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}

/// Daily local-time window during which an account's engine should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    #[serde(with = "hhmm", default = "default_window_start")]
    pub start: NaiveTime,
    #[serde(with = "hhmm", default = "default_window_end")]
    pub end: NaiveTime,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self {
            start: default_window_start(),
            end: default_window_end(),
            enabled: false,
        }
    }
}

fn default_window_start() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_window_end() -> NaiveTime {
    NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN)
}

impl ScheduleWindow {
    pub fn new(start: NaiveTime, end: NaiveTime, enabled: bool) -> Self {
        Self {
            start,
            end,
            enabled,
        }
    }

    /// A window whose start equals its end leaves the engine under manual
    /// control only.
    pub fn is_manual_only(&self) -> bool {
        self.start == self.end
    }

    /// Whether automatic evaluation applies at all.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.is_manual_only()
    }

    /// Whether `now` falls inside the window.
    pub fn contains(&self, now: NaiveTime) -> bool {
        is_in_window(self.start, self.end, now)
    }

    /// The next instant strictly after `now` at which the window opens.
    pub fn next_start_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.start);
        if today > now {
            today
        } else {
            today + TimeDelta::days(1)
        }
    }
}

/// Window membership at minute resolution.
///
/// `start < end` is a same-day window `[start, end)`. `start > end` wraps
/// past midnight. `start == end` is never "in window".
pub fn is_in_window(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    use chrono::Timelike;

    let minutes = |t: NaiveTime| t.hour() * 60 + t.minute();
    let (s, e, n) = (minutes(start), minutes(end), minutes(now));
    if s == e {
        return false;
    }
    if s < e {
        n >= s && n < e
    } else {
        n >= s || n < e
    }
}

// ---------------------------------------------------------------------------
// AccountRecord
// ---------------------------------------------------------------------------

/// Persisted configuration and state of one account.
///
/// Secret fields hold store-encrypted material; only the supervisor decrypts
/// them, and only the one matching `auth_mode`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub username: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_enc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_enc: Option<String>,
    #[serde(default = "default_beacon_key")]
    pub beacon_key: String,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub schedule: ScheduleWindow,
    #[serde(default)]
    pub log_empty_polls: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auth_expired: bool,
    #[serde(default)]
    pub last_auth_fail_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_notify_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub token: String,
}

fn default_beacon_key() -> String {
    DEFAULT_BEACON_KEY.into()
}
fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}
fn default_true() -> bool {
    true
}

impl fmt::Debug for AccountRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountRecord")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("auth_mode", &self.auth_mode)
            .field("has_password", &self.password_enc.is_some())
            .field("has_cookie", &self.cookie_enc.is_some())
            .field("beacon_key", &self.beacon_key)
            .field("cooldown_ms", &self.cooldown_ms)
            .field("schedule", &self.schedule)
            .field("enabled", &self.enabled)
            .field("auth_expired", &self.auth_expired)
            .finish()
    }
}

impl AccountRecord {
    /// A fresh record with default settings and no credentials.
    pub fn new(username: impl Into<String>, auth_mode: AuthMode, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            auth_mode,
            password_enc: None,
            cookie_enc: None,
            beacon_key: default_beacon_key(),
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            schedule: ScheduleWindow::default(),
            log_empty_polls: false,
            enabled: true,
            auth_expired: false,
            last_auth_fail_at: None,
            last_notify_at: None,
            created_at: now,
            updated_at: now,
            token: String::new(),
        }
    }

    /// The secret-free view handed to control-surface callers.
    pub fn public_view(&self) -> PublicAccount {
        PublicAccount {
            id: self.id,
            username: self.username.clone(),
            auth_mode: self.auth_mode,
            auth_expired: self.auth_expired,
            has_password: self.password_enc.is_some(),
            has_cookie: self.cookie_enc.is_some(),
            beacon_key: self.beacon_key.clone(),
            cooldown_ms: self.cooldown_ms,
            schedule: self.schedule,
            log_empty_polls: self.log_empty_polls,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
            token: self.token.clone(),
            password: None,
        }
    }
}

/// Account data safe to return to a front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicAccount {
    pub id: AccountId,
    pub username: String,
    pub auth_mode: AuthMode,
    pub auth_expired: bool,
    pub has_password: bool,
    pub has_cookie: bool,
    pub beacon_key: String,
    pub cooldown_ms: u64,
    pub schedule: ScheduleWindow,
    pub log_empty_polls: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub token: String,
    /// Only filled when the owner queries their own status by token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// ---------------------------------------------------------------------------
// Beacons
// ---------------------------------------------------------------------------

/// A named, fixed coordinate believed to be inside a radar rollcall's range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconPoint {
    pub key: String,
    pub longitude: f64,
    pub latitude: f64,
}

impl BeaconPoint {
    pub fn new(key: impl Into<String>, longitude: f64, latitude: f64) -> Self {
        Self {
            key: key.into(),
            longitude,
            latitude,
        }
    }
}

/// Ordered, read-only set of beacon points shared by every account.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconTable {
    points: Vec<BeaconPoint>,
}

impl BeaconTable {
    pub fn new(points: Vec<BeaconPoint>) -> Self {
        Self { points }
    }

    /// Teaching buildings across the campuses, in sweep order.
    pub fn campus_default() -> Self {
        Self::new(vec![
            BeaconPoint::new("ZJGD1", 120.089136, 30.302331),
            BeaconPoint::new("ZJGX1", 120.085042, 30.30173),
            BeaconPoint::new("ZJGB1", 120.077135, 30.305142),
            BeaconPoint::new("YQ4", 120.122176, 30.261555),
            BeaconPoint::new("YQ1", 120.123853, 30.262544),
            BeaconPoint::new("YQ7", 120.120344, 30.263907),
            BeaconPoint::new("ZJ1", 120.126008, 30.192908),
            BeaconPoint::new("HJC1", 120.195939, 30.272068),
            BeaconPoint::new("HJC2", 120.198193, 30.270419),
            BeaconPoint::new("ZJ2", 120.124267, 30.19139),
            BeaconPoint::new("YQSS", 120.124001, 30.265735),
            BeaconPoint::new("ZJG4", 120.073427, 30.299757),
        ])
    }

    pub fn get(&self, key: &str) -> Option<&BeaconPoint> {
        self.points.iter().find(|p| p.key == key)
    }

    pub fn validate_key(&self, key: &str) -> Result<(), ValidationError> {
        if self.get(key).is_some() {
            Ok(())
        } else {
            Err(ValidationError::UnknownBeacon(key.to_string()))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BeaconPoint> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl Default for BeaconTable {
    fn default() -> Self {
        Self::campus_default()
    }
}

// ---------------------------------------------------------------------------
// Rollcall
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollcallKind {
    Radar,
    Numeric,
    Other,
}

/// One open rollcall as listed by the platform.
///
/// Transient: read on every poll, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollcall {
    pub rollcall_id: RollcallId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub course_title: Option<String>,
    #[serde(default)]
    pub created_by_name: Option<String>,
    #[serde(default)]
    pub department_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_name: Option<String>,
    #[serde(default)]
    pub is_radar: Option<bool>,
    #[serde(default)]
    pub is_number: Option<bool>,
}

impl Rollcall {
    pub fn kind(&self) -> RollcallKind {
        if self.is_radar.unwrap_or(false) {
            RollcallKind::Radar
        } else if self.is_number.unwrap_or(false) {
            RollcallKind::Numeric
        } else {
            RollcallKind::Other
        }
    }

    /// Whether the platform already counts the account as present.
    pub fn is_on_call(&self) -> bool {
        [self.status.as_deref(), self.status_name.as_deref()]
            .into_iter()
            .flatten()
            .any(|s| s == "on_call_fine" || s == "on_call")
    }

    /// `title @ course by creator (department)`.
    pub fn describe(&self) -> String {
        format!(
            "{} @ {} by {} ({})",
            self.title.as_deref().unwrap_or("untitled"),
            self.course_title.as_deref().unwrap_or("unknown course"),
            self.created_by_name.as_deref().unwrap_or("unknown"),
            self.department_name.as_deref().unwrap_or("unknown department"),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn same_day_window() {
        assert!(is_in_window(t(8, 0), t(22, 0), t(12, 0)));
        assert!(is_in_window(t(8, 0), t(22, 0), t(8, 0)));
        assert!(!is_in_window(t(8, 0), t(22, 0), t(22, 0)));
        assert!(!is_in_window(t(8, 0), t(22, 0), t(23, 0)));
    }

    #[test]
    fn wrapping_window() {
        assert!(is_in_window(t(22, 0), t(7, 0), t(23, 30)));
        assert!(is_in_window(t(22, 0), t(7, 0), t(6, 30)));
        assert!(!is_in_window(t(22, 0), t(7, 0), t(12, 0)));
    }

    #[test]
    fn equal_bounds_never_in_window() {
        assert!(!is_in_window(t(9, 0), t(9, 0), t(9, 0)));
        let w = ScheduleWindow::new(t(9, 0), t(9, 0), true);
        assert!(w.is_manual_only());
        assert!(!w.is_active());
    }

    #[test]
    fn next_start_rolls_to_tomorrow_once_passed() {
        let w = ScheduleWindow::new(t(8, 0), t(22, 0), true);
        let day = NaiveDate::from_ymd_opt(2024, 12, 12).unwrap();

        let before = day.and_time(t(7, 0));
        assert_eq!(w.next_start_after(before), day.and_time(t(8, 0)));

        let at = day.and_time(t(8, 0));
        let tomorrow = NaiveDate::from_ymd_opt(2024, 12, 13).unwrap();
        assert_eq!(w.next_start_after(at), tomorrow.and_time(t(8, 0)));

        let evening = day.and_time(t(21, 0));
        assert_eq!(w.next_start_after(evening), tomorrow.and_time(t(8, 0)));
    }

    #[test]
    fn username_must_be_ten_digits() {
        assert!(validate_username("3200100001").is_ok());
        assert!(validate_username("320010000").is_err());
        assert!(validate_username("32001000a1").is_err());
    }

    #[test]
    fn legacy_auth_mode_names_deserialize() {
        let m: AuthMode = serde_json::from_str("\"secure_cookie\"").unwrap();
        assert_eq!(m, AuthMode::CookieOnly);
        let m: AuthMode = serde_json::from_str("\"password_persist\"").unwrap();
        assert_eq!(m, AuthMode::Password);
        assert!(AuthMode::parse("token").is_err());
    }

    #[test]
    fn schedule_window_serializes_as_hhmm() {
        let w = ScheduleWindow::new(t(22, 0), t(7, 30), true);
        let json = serde_json::to_value(w).unwrap();
        assert_eq!(json["start"], "22:00");
        assert_eq!(json["end"], "07:30");
        let back: ScheduleWindow = serde_json::from_value(json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn rollcall_on_call_and_kind() {
        let rc: Rollcall = serde_json::from_value(serde_json::json!({
            "rollcall_id": 171329,
            "title": "2024.12.12 18:51",
            "course_title": "Ethics",
            "is_radar": true,
            "is_number": false,
            "status": "absent"
        }))
        .unwrap();
        assert_eq!(rc.kind(), RollcallKind::Radar);
        assert!(!rc.is_on_call());

        let answered: Rollcall = serde_json::from_value(serde_json::json!({
            "rollcall_id": 1,
            "is_number": true,
            "status_name": "on_call_fine"
        }))
        .unwrap();
        assert_eq!(answered.kind(), RollcallKind::Numeric);
        assert!(answered.is_on_call());
    }

    #[test]
    fn credentials_debug_redacts_secret() {
        let c = Credentials::Password {
            username: "3200100001".into(),
            password: "hunter2".into(),
        };
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("REDACTED"));
    }

    #[test]
    fn campus_table_validates_keys() {
        let table = BeaconTable::campus_default();
        assert_eq!(table.len(), 12);
        assert!(table.validate_key("YQ4").is_ok());
        assert_eq!(
            table.validate_key("MOON"),
            Err(ValidationError::UnknownBeacon("MOON".into()))
        );
    }
}
