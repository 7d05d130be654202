//! Offline-first resilience layer for a book-tracking client.
//!
//! Reads go through a TTL [`cache::ResultCache`]; writes made while offline
//! are kept in a durable, strictly ordered [`queue::OfflineActionQueue`] and
//! replayed by the [`network::NetworkMonitor`] once connectivity returns.
//! [`client::ResilientClient`] ties the pieces together.

pub mod backend;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod logging;
pub mod network;
pub mod queue;
pub mod retry;
pub mod storage;
