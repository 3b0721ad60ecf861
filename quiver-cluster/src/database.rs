//! Cached replica sets and replica discovery

use crate::metrics::record_discovery;
use crate::pool::ConnectionPool;
use crate::replica::{ClusterDatabase, Replica};
use parking_lot::RwLock;
use quiver::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Routing table: database name to its latest known replica set
pub struct ClusterDatabaseManager {
    pool: Arc<ConnectionPool>,
    members: Vec<String>,
    databases: RwLock<HashMap<String, Arc<ClusterDatabase>>>,
}

impl ClusterDatabaseManager {
    pub fn new(pool: Arc<ConnectionPool>, members: Vec<String>) -> Self {
        Self {
            pool,
            members,
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// Addresses of every known cluster member
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterDatabase>> {
        self.databases.read().get(name).cloned()
    }

    /// Replace the cached entry for a database as a whole
    pub fn replace(&self, database: ClusterDatabase) -> Arc<ClusterDatabase> {
        let database = Arc::new(database);
        self.databases
            .write()
            .insert(database.name().to_string(), Arc::clone(&database));
        database
    }

    /// Error naming every member, for when no member could serve a request
    pub fn unavailable(&self) -> Error {
        Error::ClusterUnavailable {
            addresses: self.members.clone(),
        }
    }

    /// Ask members in turn for the replicas of `name`. The first answer
    /// replaces the cached entry, which stays keyed by `name`.
    pub async fn fetch_database_replicas(&self, name: &str) -> Result<Arc<ClusterDatabase>> {
        for address in &self.members {
            let res = match self.pool.get(address).await {
                Ok(conn) => conn.database_replicas(name).await,
                Err(e) => Err(e),
            };

            match res {
                Ok(replicas) => {
                    record_discovery("ok");
                    let members = replicas
                        .replicas
                        .iter()
                        .map(|info| Replica::from_info(name, info))
                        .collect();
                    let database = self.replace(ClusterDatabase::new(name, members));
                    debug!(address = %address, database = %database, "Fetched replicas");
                    return Ok(database);
                }
                Err(e) if e.is_unreachable() => {
                    record_discovery("unreachable");
                    self.pool.evict(address);
                    debug!(
                        address = %address,
                        error = %e,
                        "Member unreachable during discovery, trying next"
                    );
                }
                Err(e) => {
                    record_discovery("error");
                    return Err(e);
                }
            }
        }
        Err(self.unavailable())
    }

    /// Fetch the replicas of every database from the first member that
    /// answers, replacing each cached entry
    pub async fn all(&self) -> Result<Vec<Arc<ClusterDatabase>>> {
        for address in &self.members {
            let res = match self.pool.get(address).await {
                Ok(conn) => conn.databases_all().await,
                Err(e) => Err(e),
            };

            match res {
                Ok(all) => {
                    record_discovery("ok");
                    let databases: Vec<_> = all
                        .iter()
                        .map(|replicas| self.replace(ClusterDatabase::from_replicas(replicas)))
                        .collect();
                    info!(
                        address = %address,
                        databases = databases.len(),
                        "Fetched replicas of all databases"
                    );
                    return Ok(databases);
                }
                Err(e) if e.is_unreachable() => {
                    record_discovery("unreachable");
                    self.pool.evict(address);
                }
                Err(e) => {
                    record_discovery("error");
                    return Err(e);
                }
            }
        }
        Err(self.unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver::testing::{replica, MockConnector};

    fn manager(connector: &MockConnector, members: &[&str]) -> ClusterDatabaseManager {
        let pool = Arc::new(ConnectionPool::new(Arc::new(connector.clone())));
        ClusterDatabaseManager::new(pool, members.iter().map(|m| m.to_string()).collect())
    }

    #[tokio::test]
    async fn test_fetch_skips_unreachable_members() {
        let connector = MockConnector::new();
        connector.add_node("a:1729").set_reachable(false);
        connector
            .add_node("b:1729")
            .set_replicas("social", vec![replica("b:1729", 2, true, false)]);
        let manager = manager(&connector, &["a:1729", "b:1729"]);

        let db = manager.fetch_database_replicas("social").await.unwrap();

        assert_eq!(db.primary_replica().unwrap().address(), "b:1729");
        assert_eq!(manager.get("social").unwrap(), db);
        assert!(!manager.pool().contains("a:1729"));
    }

    #[tokio::test]
    async fn test_fetch_replaces_whole_entry() {
        let connector = MockConnector::new();
        let node = connector.add_node("a:1729");
        node.set_replicas(
            "social",
            vec![replica("a:1729", 1, true, false), replica("b:1729", 1, false, false)],
        );
        let manager = manager(&connector, &["a:1729"]);
        manager.fetch_database_replicas("social").await.unwrap();

        node.set_replicas("social", vec![replica("c:1729", 2, true, false)]);
        let db = manager.fetch_database_replicas("social").await.unwrap();

        assert_eq!(db.replicas().len(), 1);
        assert_eq!(db.replicas()[0].address(), "c:1729");
    }

    #[tokio::test]
    async fn test_fetch_caches_under_requested_name() {
        let connector = MockConnector::new();
        let node = connector.add_node("a:1729");
        node.set_replicas("Social", vec![replica("a:1729", 1, true, false)]);
        node.set_reported_name("Social", "social");
        let manager = manager(&connector, &["a:1729"]);

        let db = manager.fetch_database_replicas("Social").await.unwrap();

        assert_eq!(db.name(), "Social");
        assert_eq!(db.primary_replica().unwrap().id.database, "Social");
        assert_eq!(manager.get("Social").unwrap(), db);
        assert!(manager.get("social").is_none());
    }

    #[tokio::test]
    async fn test_fetch_all_unreachable_names_members() {
        let connector = MockConnector::new();
        connector.add_node("a:1729").set_reachable(false);
        let manager = manager(&connector, &["a:1729", "b:1729"]);

        let err = manager.fetch_database_replicas("social").await.unwrap_err();
        assert_eq!(
            err,
            Error::ClusterUnavailable {
                addresses: vec!["a:1729".to_string(), "b:1729".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_domain_error_propagates() {
        let connector = MockConnector::new();
        connector.add_node("a:1729");
        connector
            .add_node("b:1729")
            .set_replicas("social", vec![replica("b:1729", 1, true, false)]);
        let manager = manager(&connector, &["a:1729", "b:1729"]);

        // a:1729 does not know the database and says so
        let err = manager.fetch_database_replicas("social").await.unwrap_err();
        assert_eq!(err.error_type(), "domain");
        assert!(manager.get("social").is_none());
    }

    #[tokio::test]
    async fn test_all_primes_every_database() {
        let connector = MockConnector::new();
        let node = connector.add_node("a:1729");
        node.set_replicas("social", vec![replica("a:1729", 1, true, false)]);
        node.set_replicas("billing", vec![replica("a:1729", 1, true, false)]);
        let manager = manager(&connector, &["a:1729"]);

        let all = manager.all().await.unwrap();

        assert_eq!(all.len(), 2);
        assert!(manager.get("social").is_some());
        assert!(manager.get("billing").is_some());
    }
}
