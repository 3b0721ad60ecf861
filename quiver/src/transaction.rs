//! Transactions over a dedicated stream

use crate::config::ClientConfig;
use crate::connection::NodeConnection;
use crate::error::Result;
use crate::metrics::RpcTimer;
use crate::stream::{BidirectionalStream, ResponseFuture, ResponseParts};
use crate::types::{
    Request, SessionId, TransactionOpenReq, TransactionOptions, TransactionReqBody,
    TransactionType,
};
use std::time::Duration;
use tracing::debug;

/// An open transaction. Owns one stream which is never reused.
pub struct Transaction {
    transaction_type: TransactionType,
    options: TransactionOptions,
    stream: BidirectionalStream,
}

impl Transaction {
    pub(crate) async fn open(
        connection: &dyn NodeConnection,
        session_id: &SessionId,
        transaction_type: TransactionType,
        options: TransactionOptions,
        network_latency: Duration,
        config: &ClientConfig,
    ) -> Result<Self> {
        let timer = RpcTimer::new("transaction_open", connection.address());
        let channel = match connection.transaction_stream().await {
            Ok(channel) => channel,
            Err(e) => {
                timer.error(e.error_type());
                return Err(e);
            }
        };
        let stream =
            BidirectionalStream::new(connection.address(), channel, config.dispatch_interval());

        let open = TransactionReqBody::Open(TransactionOpenReq {
            session_id: session_id.clone(),
            transaction_type,
            options: options.clone(),
            network_latency_ms: network_latency.as_millis() as u64,
        });

        match stream.single(open, false)?.await {
            Ok(_) => timer.success(),
            Err(e) => {
                timer.error(e.error_type());
                stream.close(None);
                return Err(e);
            }
        }

        debug!(
            address = %connection.address(),
            session_id = %session_id,
            transaction_type = ?transaction_type,
            "Opened transaction"
        );

        Ok(Self {
            transaction_type,
            options,
            stream,
        })
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    /// Send a request answered by a single response.
    ///
    /// Requests are batched with others issued within the dispatch interval.
    pub fn execute(&self, request: Request) -> Result<ResponseFuture> {
        self.stream.single(TransactionReqBody::Payload(request), true)
    }

    /// Send a request answered by a stream of response parts
    pub fn stream(&self, request: Request) -> Result<ResponseParts> {
        self.stream.stream(TransactionReqBody::Payload(request))
    }

    /// Commit and close the transaction
    pub async fn commit(&self) -> Result<()> {
        let res = self.stream.single(TransactionReqBody::Commit, false)?.await;
        self.stream.close(None);
        res.map(|_| ())
    }

    /// Roll back uncommitted changes; the transaction stays open
    pub async fn rollback(&self) -> Result<()> {
        self.stream
            .single(TransactionReqBody::Rollback, false)?
            .await
            .map(|_| ())
    }

    pub fn close(&self) {
        self.stream.close(None);
    }
}
