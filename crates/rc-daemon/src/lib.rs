//! Multi-account service around the auto-sign engine.
//!
//! - [`scheduler`]: daily window control of one engine
//! - [`supervisor`]: account registry, lifecycle and owner access
//! - [`store`]: encrypted JSON persistence
//! - [`control_api`]: HTTP control surface
//! - [`daemon`]: process wiring and graceful shutdown

pub mod control_api;
pub mod daemon;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod supervisor;
