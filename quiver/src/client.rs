//! Single-server client
//!
//! Owns one connection and the registry of sessions opened through it.
//! Dropping the client closes every session still open.

use crate::config::ClientConfig;
use crate::connection::{Connector, NodeConnection};
use crate::error::Result;
use crate::session::{Session, SessionRegistry};
use crate::transport::QuicConnector;
use crate::types::{SessionOptions, SessionType};
use std::sync::Arc;
use tracing::info;

/// Client for a standalone Quiver server
pub struct Client {
    config: ClientConfig,
    connection: Arc<dyn NodeConnection>,
    sessions: SessionRegistry,
}

impl Client {
    /// Connect to a server over QUIC
    pub async fn connect(address: &str, config: ClientConfig) -> Result<Self> {
        let connector = QuicConnector::new(config.clone())?;
        Self::with_connector(address, config, &connector).await
    }

    /// Connect using a custom connector
    pub async fn with_connector(
        address: &str,
        config: ClientConfig,
        connector: &dyn Connector,
    ) -> Result<Self> {
        let connection = connector.connect(address).await?;
        Ok(Self::with_connection(connection, config))
    }

    /// Wrap an already established connection
    pub fn with_connection(connection: Arc<dyn NodeConnection>, config: ClientConfig) -> Self {
        Self {
            config,
            connection,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn address(&self) -> &str {
        self.connection.address()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a session on `database`
    pub async fn session(
        &self,
        database: &str,
        session_type: SessionType,
        options: SessionOptions,
    ) -> Result<Arc<Session>> {
        Session::open(
            Arc::clone(&self.connection),
            database,
            session_type,
            options,
            &self.config,
            &self.sessions,
        )
        .await
    }

    /// Sessions opened through this client that are still open
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Close every open session
    pub async fn close(&self) {
        info!(
            address = %self.address(),
            sessions = self.sessions.len(),
            "Closing client"
        );
        self.sessions.close_all().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.sessions.close_all_in_background();
    }
}
