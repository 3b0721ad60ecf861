//! Transport layer for client-server communication
//!
//! Provides QUIC-based transport using Quinn with TLS encryption. Unary
//! calls go through a tarpc client on one bidirectional stream; every
//! transaction opens its own bidirectional stream.

mod connection;
mod quic;

pub use connection::{QuicConnector, QuicNodeConnection, STREAM_KIND_RPC, STREAM_KIND_TRANSACTION};
pub use quic::make_client_endpoint;
