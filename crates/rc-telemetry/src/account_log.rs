use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

pub const DEFAULT_LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    /// Info stays in the log; everything else reaches the owner.
    pub fn is_pushed(&self) -> bool {
        !matches!(self, LogLevel::Info)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Delivery channel for owner and operator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Message addressed to the owner of `account`.
    async fn push(&self, account: &str, level: LogLevel, message: &str);

    /// Message addressed to the service operator.
    async fn control(&self, message: &str);
}

/// Writes notifications to the operator log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn push(&self, account: &str, level: LogLevel, message: &str) {
        tracing::info!(target: "autosign::notify", account, %level, "{message}");
    }

    async fn control(&self, message: &str) {
        tracing::info!(target: "autosign::notify", channel = "control", "{message}");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub account: String,
    pub level: LogLevel,
    pub message: String,
}

/// Keeps every notification in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pushes: Mutex<Vec<Notification>>,
    controls: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushes(&self) -> Vec<Notification> {
        self.pushes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn controls(&self) -> Vec<String> {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Pushes whose message contains `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.pushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|n| n.message.contains(needle))
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn push(&self, account: &str, level: LogLevel, message: &str) {
        self.pushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Notification {
                account: account.to_string(),
                level,
                message: message.to_string(),
            });
    }

    async fn control(&self, message: &str) {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }
}

// ---------------------------------------------------------------------------
// AccountLogger
// ---------------------------------------------------------------------------

/// Bounded, owner-visible log for one account.
///
/// Every entry is mirrored to `tracing`. Entries above info are also pushed
/// through the [`Notifier`]. The oldest entry is dropped once `capacity` is
/// reached.
pub struct AccountLogger {
    account: String,
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for AccountLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountLogger")
            .field("account", &self.account)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl AccountLogger {
    pub fn new(account: impl Into<String>, capacity: usize, notifier: Arc<dyn Notifier>) -> Self {
        let capacity = capacity.max(1);
        Self {
            account: account.into(),
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            notifier,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message.into()).await;
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.record(LogLevel::Success, message.into()).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.record(LogLevel::Warning, message.into()).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message.into()).await;
    }

    async fn record(&self, level: LogLevel, message: String) {
        let account = self.account.as_str();
        match level {
            LogLevel::Info | LogLevel::Success => tracing::info!(account, %level, "{message}"),
            LogLevel::Warning => tracing::warn!(account, "{message}"),
            LogLevel::Error => tracing::error!(account, "{message}"),
        }

        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(LogEntry {
                timestamp: Utc::now(),
                level,
                message: message.clone(),
            });
        }

        if level.is_pushed() {
            self.notifier.push(account, level, &message).await;
        }
    }

    /// Up to `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_past_capacity() {
        let logger = AccountLogger::new("3200100001", 3, Arc::new(RecordingNotifier::new()));
        for i in 0..5 {
            logger.info(format!("poll {i}")).await;
        }
        let recent = logger.recent(None);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "poll 2");
        assert_eq!(recent[2].message, "poll 4");

        let last = logger.recent(Some(1));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].message, "poll 4");
    }

    #[tokio::test]
    async fn only_non_info_entries_are_pushed() {
        let notifier = Arc::new(RecordingNotifier::new());
        let logger = AccountLogger::new("3200100001", 10, notifier.clone());
        logger.info("no rollcalls").await;
        logger.success("signed in").await;
        logger.warn("radar failed").await;
        logger.error("session expired").await;

        let pushes = notifier.pushes();
        assert_eq!(pushes.len(), 3);
        assert_eq!(pushes[0].level, LogLevel::Success);
        assert_eq!(pushes[2].account, "3200100001");
        assert_eq!(logger.len(), 4);
    }

    #[tokio::test]
    async fn clear_empties_history() {
        let logger = AccountLogger::new("a", 10, Arc::new(TracingNotifier));
        logger.info("x").await;
        logger.clear();
        assert!(logger.is_empty());
    }

    #[test]
    fn entry_serializes_lowercase_level() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Warning,
            message: "m".into(),
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["level"], "warning");
    }
}
