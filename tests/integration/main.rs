//! Datum integration test harness.
//!
//! Every test runs a real client against fake peers on loopback UDP:
//!
//!   cargo test --test integration
//!
//! Fake peers live in spawned tasks owned by a `PeerGuard`, which aborts
//! them on drop so a failing test cannot leave sockets behind.

mod fault;
mod files;
mod infra;
mod nat;
mod sessions;

pub use infra::*;
