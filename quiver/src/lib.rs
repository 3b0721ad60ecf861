//! Quiver - client runtime for Quiver database servers
//!
//! This crate talks to a single server. Cluster routing and failover live in
//! `quiver-cluster`, which builds on the types exported here.
//!
//! # Architecture
//!
//! - **Registry**: correlates request ids with the slots awaiting their responses
//! - **Dispatcher**: one writer task per transaction stream, batched or immediate sends
//! - **Stream**: multiplexes unary and streamed requests over one transaction stream
//! - **Session**: server session kept alive by a periodic pulse, factory for transactions
//! - **Transport**: Quinn QUIC with TLS; tarpc for unary calls, framed bincode for transactions
//!
//! # Key Operations
//!
//! - Sessions: open, pulse, close
//! - Transactions: open, execute, stream, commit, rollback, close
//! - Discovery: list cluster members and database replicas

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod session;
pub mod stream;
pub mod transaction;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

mod client;

pub use client::Client;
pub use config::{ClientConfig, ClientTlsConfig};
pub use connection::{Connector, MessageSink, MessageStream, NodeConnection, TransactionChannel};
pub use error::{Error, Result};
pub use session::{Session, SessionRegistry};
pub use stream::{BidirectionalStream, ResponseFuture, ResponseParts};
pub use transaction::Transaction;
pub use transport::{QuicConnector, QuicNodeConnection};
pub use types::*;
