//! Observability for the auto-sign service.
//!
//! - **Logging**: human-readable or JSON operator logs via `tracing-subscriber`
//! - **Account log**: bounded per-account history shown to the account owner,
//!   with push notifications through a pluggable [`account_log::Notifier`]

pub mod account_log;
pub mod logging;
