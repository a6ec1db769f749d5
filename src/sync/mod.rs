//! Client side of state synchronization.
//!
//! [`Replica`] is the locally persisted copy of a tenant's records and
//! [`SyncClient`] keeps it current against a sync server.

pub mod client;
pub mod replica;

pub use client::{Identity, PullSummary, SnapshotSummary, SyncClient, SyncClientError};
pub use replica::{Applied, Replica, ReplicaError};
