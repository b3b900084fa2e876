use crate::types::{BeaconPoint, BeaconTable, DEFAULT_COOLDOWN_MS};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "AUTOSIGN_CONFIG";

/// Top-level configuration loaded from `~/.autosign/config.toml`.
///
/// Account credentials never live here; they are kept encrypted by the
/// account store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub control: ControlConfig,
    /// Replaces the built-in campus beacon table when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub beacons: Vec<BeaconPoint>,
}

impl Config {
    /// Load config from `$AUTOSIGN_CONFIG` or `~/.autosign/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.schedule.validate()?;
        for (i, b) in self.beacons.iter().enumerate() {
            if b.key.trim().is_empty() {
                return Err(ConfigError::Validation(format!("beacons[{i}].key is empty")));
            }
            if !(-180.0..=180.0).contains(&b.longitude) || !(-90.0..=90.0).contains(&b.latitude) {
                return Err(ConfigError::Validation(format!(
                    "beacons[{i}] `{}` has out-of-range coordinates",
                    b.key
                )));
            }
        }
        Ok(())
    }

    /// The effective beacon table.
    pub fn beacon_table(&self) -> BeaconTable {
        if self.beacons.is_empty() {
            BeaconTable::campus_default()
        } else {
            BeaconTable::new(self.beacons.clone())
        }
    }

    fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(p);
        }
        data_dir().join("config.toml")
    }
}

/// `~/.autosign`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".autosign")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Where and how to talk to the course platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Redirects to this host mean the session cookie is no longer valid.
    #[serde(default = "default_identity_host")]
    pub identity_host: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_answer_api_version")]
    pub answer_api_version: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            identity_host: default_identity_host(),
            user_agent: default_user_agent(),
            answer_api_version: default_answer_api_version(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://courses.zju.edu.cn".into()
}
fn default_identity_host() -> String {
    "identity.zju.edu.cn".into()
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
        .into()
}
fn default_answer_api_version() -> String {
    "1.1.2".into()
}
fn default_request_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Concurrent submissions per numeric brute-force batch.
    #[serde(default = "default_bruteforce_batch_size")]
    pub bruteforce_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            bruteforce_batch_size: default_bruteforce_batch_size(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bruteforce_batch_size == 0 || self.bruteforce_batch_size > 10_000 {
            return Err(ConfigError::Validation(format!(
                "engine.bruteforce_batch_size must be in 1..=10000, got {}",
                self.bruteforce_batch_size
            )));
        }
        if self.cooldown_ms == 0 {
            return Err(ConfigError::Validation(
                "engine.cooldown_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}
fn default_bruteforce_batch_size() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Pause between stopping and restarting an engine during a transition.
    #[serde(default = "default_transition_delay_ms")]
    pub transition_delay_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            transition_delay_ms: default_transition_delay_ms(),
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_secs == 0 {
            return Err(ConfigError::Validation(
                "schedule.tick_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_tick_secs() -> u64 {
    30
}
fn default_transition_delay_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Minimum spacing between two auth-expiry notifications per account.
    #[serde(default = "default_auth_notify_interval_hours")]
    pub auth_notify_interval_hours: u64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auth_notify_interval_hours: default_auth_notify_interval_hours(),
            log_capacity: default_log_capacity(),
        }
    }
}

fn default_auth_notify_interval_hours() -> u64 {
    24
}
fn default_log_capacity() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// One-shot invite codes accepted by `create_via_invite`.
    #[serde(default)]
    pub invite_codes: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            key_path: default_key_path(),
            invite_codes: Vec::new(),
        }
    }
}

fn default_store_path() -> String {
    data_dir().join("accounts.json").to_string_lossy().into_owned()
}
fn default_key_path() -> String {
    data_dir().join("store.key").to_string_lossy().into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: default_control_host(),
            port: default_control_port(),
        }
    }
}

fn default_control_host() -> String {
    "127.0.0.1".into()
}
fn default_control_port() -> u16 {
    9870
}
