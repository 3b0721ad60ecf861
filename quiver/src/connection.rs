//! Node connection abstraction
//!
//! `NodeConnection` is everything the runtime needs from one server: the
//! unary session and discovery calls, and a way to open a fresh
//! bidirectional stream for each transaction. The QUIC transport in
//! [`crate::transport`] is the production implementation.

use crate::error::{Error, Result};
use crate::types::{
    ClientMessage, DatabaseReplicas, ServerMessage, SessionId, SessionOpenReq, SessionOpenRes,
};
use async_trait::async_trait;
use futures::{Sink, Stream};
use std::pin::Pin;
use std::sync::Arc;

/// Outbound half of a transaction stream
pub type MessageSink = Pin<Box<dyn Sink<ClientMessage, Error = Error> + Send>>;

/// Inbound half of a transaction stream. A disconnect surfaces as an error
/// item or as the end of the stream.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<ServerMessage>> + Send>>;

/// Both halves of one streaming connection
pub struct TransactionChannel {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

impl TransactionChannel {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<ClientMessage, Error = Error> + Send + 'static,
        R: Stream<Item = Result<ServerMessage>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// A connection to one server process
#[async_trait]
pub trait NodeConnection: Send + Sync {
    /// Address of the server this connection talks to
    fn address(&self) -> &str;

    async fn session_open(&self, req: SessionOpenReq) -> Result<SessionOpenRes>;

    /// Returns whether the server still considers the session alive
    async fn session_pulse(&self, session_id: &SessionId) -> Result<bool>;

    async fn session_close(&self, session_id: &SessionId) -> Result<()>;

    /// Open a new streaming channel for one transaction
    async fn transaction_stream(&self) -> Result<TransactionChannel>;

    /// Addresses of every member of the cluster this server belongs to
    async fn servers_all(&self) -> Result<Vec<String>>;

    /// Replica view of one database as seen by this server
    async fn database_replicas(&self, database: &str) -> Result<DatabaseReplicas>;

    async fn databases_all(&self) -> Result<Vec<DatabaseReplicas>>;
}

/// Opens connections by address
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn NodeConnection>>;
}
