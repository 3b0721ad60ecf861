//! Connections to cluster members, keyed by address

use parking_lot::RwLock;
use quiver::metrics::record_connection_pool_size;
use quiver::{Connector, NodeConnection, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Lazily connected pool of node connections
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<String, Arc<dyn NodeConnection>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a connection to the specified node
    pub async fn get(&self, address: &str) -> Result<Arc<dyn NodeConnection>> {
        if let Some(conn) = self.connections.read().get(address) {
            return Ok(Arc::clone(conn));
        }

        let conn = self.connector.connect(address).await?;

        let mut connections = self.connections.write();
        // A concurrent caller may have connected first; keep theirs
        let conn = Arc::clone(
            connections
                .entry(address.to_string())
                .or_insert(conn),
        );
        record_connection_pool_size(connections.len());
        Ok(conn)
    }

    /// Drop the connection to a node that stopped answering
    pub fn evict(&self, address: &str) {
        let mut connections = self.connections.write();
        if connections.remove(address).is_some() {
            debug!(address = %address, "Evicted connection");
            record_connection_pool_size(connections.len());
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.connections.read().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
