//! Cluster client
//!
//! Discovers the cluster members from the configured addresses, then routes
//! every session and transaction through a failsafe task.

use crate::config::ClusterClientConfig;
use crate::database::ClusterDatabaseManager;
use crate::failsafe::{run_any_replica, run_primary_replica, FailsafeTask, FnTask};
use crate::metrics::record_cluster_members;
use crate::pool::ConnectionPool;
use crate::replica::Replica;
use crate::session::ClusterSession;
use quiver::{
    Connector, Error, QuicConnector, Result, Session, SessionOptions, SessionRegistry, SessionType,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by the client and the sessions it hands out
pub(crate) struct ClusterContext {
    pub(crate) config: ClusterClientConfig,
    pub(crate) databases: ClusterDatabaseManager,
    pub(crate) sessions: SessionRegistry,
    closed: AtomicBool,
}

impl ClusterContext {
    /// Whether the owning client was closed or dropped
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open a single-node session on the server hosting `replica`
    pub(crate) async fn open_session(
        &self,
        replica: &Replica,
        session_type: SessionType,
        options: &SessionOptions,
    ) -> Result<Arc<Session>> {
        let connection = self.databases.pool().get(replica.address()).await?;
        Session::open(
            connection,
            &replica.id.database,
            session_type,
            options.clone(),
            &self.config.client,
            &self.sessions,
        )
        .await
    }

    /// Run `task` with the strategy selected by the session options
    pub(crate) async fn run_failsafe<T: FailsafeTask>(
        &self,
        database: &str,
        read_any_replica: bool,
        task: &T,
    ) -> Result<T::Output> {
        if read_any_replica {
            run_any_replica(&self.databases, database, task).await
        } else {
            run_primary_replica(&self.databases, &self.config.failsafe, database, task).await
        }
    }
}

/// Client for a replicated Quiver deployment
pub struct ClusterClient {
    context: Arc<ClusterContext>,
}

impl ClusterClient {
    /// Connect to the cluster over QUIC
    pub async fn connect(config: ClusterClientConfig) -> Result<Self> {
        let connector = QuicConnector::new(config.client.clone())?;
        Self::with_connector(config, Arc::new(connector)).await
    }

    /// Connect using a custom connector
    pub async fn with_connector(
        config: ClusterClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new(connector));
        let members = fetch_members(&pool, &config.addresses).await?;

        info!(members = ?members, "Connected to cluster");
        record_cluster_members(members.len());

        Ok(Self {
            context: Arc::new(ClusterContext {
                config,
                databases: ClusterDatabaseManager::new(pool, members),
                sessions: SessionRegistry::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ClusterClientConfig {
        &self.context.config
    }

    /// Addresses of every cluster member
    pub fn members(&self) -> &[String] {
        self.context.databases.members()
    }

    /// Replica routing table
    pub fn databases(&self) -> &ClusterDatabaseManager {
        &self.context.databases
    }

    /// Single-node sessions currently open through this client
    pub fn sessions(&self) -> &SessionRegistry {
        &self.context.sessions
    }

    /// Open a session on `database`.
    ///
    /// Lands on the primary replica unless `options.read_any_replica` is set,
    /// in which case the preferred replica is tried first.
    pub async fn session(
        &self,
        database: &str,
        session_type: SessionType,
        options: SessionOptions,
    ) -> Result<ClusterSession> {
        let read_any_replica = options.read_any_replica;
        let context = Arc::clone(&self.context);
        let task_options = options.clone();
        let task = FnTask::new(move |replica: Replica| {
            let context = Arc::clone(&context);
            let options = task_options.clone();
            async move {
                let session = context.open_session(&replica, session_type, &options).await?;
                Ok::<_, Error>((replica, session))
            }
        });

        let (replica, session) = self
            .context
            .run_failsafe(database, read_any_replica, &task)
            .await?;

        debug!(database = %database, replica = %replica.id, "Opened cluster session");
        Ok(ClusterSession::new(
            Arc::clone(&self.context),
            database,
            session_type,
            options,
            replica,
            session,
        ))
    }

    /// Close every session opened through this client. Cluster sessions
    /// refuse new transactions afterwards.
    pub async fn close(&self) {
        info!(sessions = self.sessions().len(), "Closing cluster client");
        self.context.closed.store(true, Ordering::SeqCst);
        self.context.sessions.close_all().await;
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        self.context.closed.store(true, Ordering::SeqCst);
        self.context.sessions.close_all_in_background();
    }
}

/// Ask the configured addresses in turn for the member list
async fn fetch_members(pool: &ConnectionPool, addresses: &[String]) -> Result<Vec<String>> {
    for address in addresses {
        let res = match pool.get(address).await {
            Ok(conn) => conn.servers_all().await,
            Err(e) => Err(e),
        };

        match res {
            Ok(mut servers) if !servers.is_empty() => {
                let mut seen = HashSet::new();
                servers.retain(|s| seen.insert(s.clone()));
                return Ok(servers);
            }
            Ok(_) => warn!(address = %address, "Server reported no cluster members"),
            Err(e) if e.is_unreachable() => {
                pool.evict(address);
                debug!(address = %address, error = %e, "Unable to fetch members, trying next");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::ClusterUnavailable {
        addresses: addresses.to_vec(),
    })
}
