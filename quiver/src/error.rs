//! Client error types
//!
//! Every error is tagged with its kind where it is created. Retry decisions
//! in the cluster layer only ever look at the variant, never at the message.

use crate::types::{RequestId, ServerError, ServerErrorKind};
use thiserror::Error;

/// Errors that can occur while talking to a Quiver server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Connection refused, reset or otherwise unavailable
    #[error("Unable to reach {address}: {message}")]
    Unreachable { address: String, message: String },

    /// The contacted replica is not (or no longer) the primary
    #[error("Replica is not the primary: {0}")]
    NotPrimary(String),

    /// The server sent a response for a request id nobody is waiting on
    #[error("Received a response for unknown request id {0}")]
    UnknownRequestId(RequestId),

    /// A request id was registered twice on the same connection
    #[error("Request id {0} is already registered")]
    DuplicateRequestId(RequestId),

    /// Malformed or out-of-order message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("The session has been closed")]
    SessionClosed,

    #[error("The transaction has been closed")]
    TransactionClosed,

    /// All replicas or cluster members were tried without success
    #[error("Unable to connect to the cluster, attempted servers: {}", .addresses.join(", "))]
    ClusterUnavailable { addresses: Vec<String> },

    /// Query or schema error reported by the server, passed through verbatim
    #[error("{0}")]
    Domain(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Create an unreachable error for an address
    pub fn unreachable(address: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Unreachable {
            address: address.into(),
            message: message.to_string(),
        }
    }

    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Unreachable { .. } => "unreachable",
            Error::NotPrimary(_) => "not_primary",
            Error::UnknownRequestId(_) => "unknown_request_id",
            Error::DuplicateRequestId(_) => "duplicate_request_id",
            Error::ProtocolViolation(_) => "protocol_violation",
            Error::SessionClosed => "session_closed",
            Error::TransactionClosed => "transaction_closed",
            Error::ClusterUnavailable { .. } => "cluster_unavailable",
            Error::Domain(_) => "domain",
            Error::Config(_) => "config",
            Error::Tls(_) => "tls",
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::Unreachable { .. })
    }

    pub fn is_not_primary(&self) -> bool {
        matches!(self, Error::NotPrimary(_))
    }

    /// Whether the error makes the owning connection unusable
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnknownRequestId(_) | Error::DuplicateRequestId(_) | Error::ProtocolViolation(_)
        )
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        match err.kind {
            ServerErrorKind::NotPrimary => Error::NotPrimary(err.message),
            ServerErrorKind::Domain => Error::Domain(err.message),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::ProtocolViolation(format!("malformed message: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_kind_is_preserved() {
        let err: Error = ServerError::not_primary("term moved on").into();
        assert!(err.is_not_primary());

        let err: Error = ServerError::domain("unknown type 'person'").into();
        assert_eq!(err, Error::Domain("unknown type 'person'".into()));
        assert_eq!(err.to_string(), "unknown type 'person'");
    }

    #[test]
    fn test_cluster_unavailable_names_addresses() {
        let err = Error::ClusterUnavailable {
            addresses: vec!["10.0.0.1:1729".into(), "10.0.0.2:1729".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1:1729"));
        assert!(msg.contains("10.0.0.2:1729"));
        assert_eq!(err.error_type(), "cluster_unavailable");
    }

    #[test]
    fn test_retry_predicates() {
        assert!(Error::unreachable("a:1", "refused").is_unreachable());
        assert!(!Error::TransactionClosed.is_unreachable());
        assert!(Error::UnknownRequestId(RequestId::new()).is_protocol_violation());
        assert!(!Error::Domain("x".into()).is_protocol_violation());
    }
}
