//! Quiver Cluster - replica discovery and failover for Quiver deployments
//!
//! Builds on the single-node runtime in `quiver` and decides which server
//! every session and transaction talks to.
//!
//! # Architecture
//!
//! - **Replica**: per-database replica sets with primary and preferred selection
//! - **Database manager**: cached replica sets, refreshed from any reachable member
//! - **Failsafe**: retryable tasks bound to a primary-only or any-replica strategy
//! - **Pool**: one connection per member, evicted when the member stops answering
//! - **Client**: member discovery, cluster sessions and transactions
//!
//! # Key Operations
//!
//! - Discovery: members, replicas of one database, replicas of all databases
//! - Routing: primary replica by highest term, preferred replica for reads
//! - Failover: rediscover and retry on `NotPrimary` or `Unreachable`

pub mod config;
pub mod database;
pub mod failsafe;
pub mod metrics;
pub mod pool;
pub mod replica;

mod client;
mod session;

pub use client::ClusterClient;
pub use config::{ClusterClientConfig, FailsafeConfig};
pub use database::ClusterDatabaseManager;
pub use failsafe::{run_any_replica, run_primary_replica, FailsafeTask, FnTask};
pub use pool::ConnectionPool;
pub use replica::{ClusterDatabase, Replica, ReplicaId};
pub use session::ClusterSession;
