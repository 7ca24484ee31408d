//! A DNS reverse proxy.
//!
//! Routes each query to an upstream chosen by exact name match, guards
//! zone transfers with a per-zone allow-list and reloads its routing
//! table without blocking requests in flight.

pub mod config;
pub mod dns;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod resolver;
pub mod transport;
