//! Multi-tenant state synchronization.
//!
//! The server side ([`db`], [`fanout`], [`server`]) stores versioned records
//! per tenant and serves them as snapshots, an incremental change feed, and
//! realtime events. The client side ([`sync`]) keeps a local replica current.

pub mod config;
pub mod db;
pub mod fanout;
pub mod models;
pub mod server;
pub mod sync;
