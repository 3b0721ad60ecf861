//! tarpc service definition for the unary server calls
//!
//! Transaction traffic does not go through this service; each transaction
//! uses its own bidirectional stream, see [`crate::transport`].

use crate::types::{DatabaseReplicas, ServerError, SessionId, SessionOpenReq, SessionOpenRes};

/// Quiver server RPC service definition.
#[tarpc::service]
pub trait QuiverRpc {
    // ========================================
    // Sessions
    // ========================================

    /// Open a session on a database
    async fn session_open(req: SessionOpenReq) -> Result<SessionOpenRes, ServerError>;

    /// Keep a session alive; returns false if the server dropped it
    async fn session_pulse(session_id: SessionId) -> bool;

    /// Close a session. Closing an unknown session succeeds.
    async fn session_close(session_id: SessionId) -> Result<(), ServerError>;

    // ========================================
    // Cluster discovery
    // ========================================

    /// Addresses of all cluster members
    async fn servers_all() -> Vec<String>;

    /// Replicas of one database as known by this server
    async fn database_replicas(database: String) -> Result<DatabaseReplicas, ServerError>;

    /// Replicas of every database as known by this server
    async fn databases_all() -> Vec<DatabaseReplicas>;
}
