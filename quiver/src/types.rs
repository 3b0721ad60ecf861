//! Wire types shared by the client and the server
//!
//! Payloads are opaque to this crate. Requests and responses carry a `kind`
//! discriminator chosen by whoever builds them; the runtime only looks at
//! the request id and the markers it attaches itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Correlation key attached to every transaction request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh id. Ids are never reused.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-issued session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Vec<u8>);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Opaque request built by a payload collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub kind: String,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Opaque response (or response part) returned to a payload collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub kind: String,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Data,
    Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Read,
    Write,
}

/// Options sent with a session open request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub session_idle_timeout_ms: Option<u64>,
    /// Allow the session to be served by any replica instead of the primary
    #[serde(default)]
    pub read_any_replica: bool,
}

/// Options sent with a transaction open request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    #[serde(default)]
    pub transaction_timeout_ms: Option<u64>,
    #[serde(default)]
    pub schema_lock_acquire_timeout_ms: Option<u64>,
    /// Number of answers the server sends before asking the client to continue
    #[serde(default)]
    pub prefetch_size: Option<u32>,
    #[serde(default)]
    pub read_any_replica: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpenReq {
    pub database: String,
    pub session_type: SessionType,
    pub options: SessionOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpenRes {
    pub session_id: SessionId,
    /// Time the server spent processing the open, excluded from latency
    pub server_duration_ms: u64,
}

impl SessionOpenRes {
    pub fn server_duration(&self) -> Duration {
        Duration::from_millis(self.server_duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOpenReq {
    pub session_id: SessionId,
    pub transaction_type: TransactionType,
    pub options: TransactionOptions,
    /// Estimated one-way latency so the server can compensate timeouts
    pub network_latency_ms: u64,
}

/// Body of one request sent on a transaction stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionReqBody {
    Open(TransactionOpenReq),
    Commit,
    Rollback,
    /// Ask the server for the next batch of a paged stream
    StreamContinue,
    Payload(Request),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReq {
    pub req_id: RequestId,
    pub body: TransactionReqBody,
}

/// One frame written by the client: a batch of requests in enqueue order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub reqs: Vec<TransactionReq>,
}

/// One element of a streamed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResPart {
    Data(Response),
    /// The server paused; the client must send a `StreamContinue`
    Continue,
    /// Terminal end-of-parts signal
    Done,
    Failure(ServerError),
}

/// One frame written by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Res {
        req_id: RequestId,
        res: std::result::Result<Response, ServerError>,
    },
    ResPart {
        req_id: RequestId,
        part: ResPart,
    },
    /// Stream-level failure not tied to a request; terminates the stream
    Failure(ServerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerErrorKind {
    NotPrimary,
    Domain,
}

/// Error reported by the server, serialized across the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: String,
}

impl ServerError {
    pub fn not_primary(message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::NotPrimary,
            message: message.into(),
        }
    }

    pub fn domain(message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::Domain,
            message: message.into(),
        }
    }
}

/// Replica description returned by cluster discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub address: String,
    pub term: u64,
    pub is_primary: bool,
    pub is_preferred: bool,
}

/// All replicas of one database as seen by one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseReplicas {
    pub name: String,
    pub replicas: Vec<ReplicaInfo>,
}
