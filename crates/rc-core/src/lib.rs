//! Shared domain types, configuration, clocks, and the account-store
//! abstraction for the rollcall auto-sign service.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod store;
pub mod types;
