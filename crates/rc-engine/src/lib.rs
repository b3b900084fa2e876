//! Rollcall answering for a single account.
//!
//! Leaves first: [`geolocation`] estimates a position from distances,
//! [`client`] talks to the course platform, [`responder`] answers one
//! rollcall, and [`engine`] runs the poll loop under the explicit
//! [`state_machine`].

pub mod client;
pub mod engine;
pub mod geolocation;
pub mod responder;
pub mod state_machine;
