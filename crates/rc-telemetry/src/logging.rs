//! Operator log setup.
//!
//! Every entry point funnels into [`init`]. Installing the global subscriber
//! twice is a no-op, so tests may call these freely.

use tracing_subscriber::{fmt, EnvFilter};

/// HTTP plumbing that is only interesting when something is broken.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "h2=warn"];

/// Build the filter: `RUST_LOG` wins, otherwise `default_level` with the
/// HTTP stack kept at `warn`.
pub fn filter_for(default_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut directives = default_level.trim().to_string();
    if directives.is_empty() {
        directives.push_str("info");
    }
    for quiet in QUIET_TARGETS {
        directives.push(',');
        directives.push_str(quiet);
    }
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Human-readable output.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, false);
}

/// One JSON object per line.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, true);
}

/// Install the subscriber, JSON when `json` is set (`[general] json_logs`).
pub fn init(service_name: &str, default_level: &str, json: bool) {
    let filter = filter_for(default_level);
    let installed = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init()
            .is_ok()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
    };

    if installed {
        tracing::info!(service = service_name, json, "logging initialised");
    }
}
