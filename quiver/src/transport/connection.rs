//! QUIC node connections
//!
//! The first bidirectional stream of a connection carries the tarpc client;
//! every transaction opens another one. The first byte written on a stream
//! tells the server which of the two it is.

use super::quic::make_client_endpoint;
use crate::config::ClientConfig;
use crate::connection::{Connector, NodeConnection, TransactionChannel};
use crate::error::{Error, Result};
use crate::metrics::{record_connection_established, record_connection_failed, RpcTimer};
use crate::service::QuiverRpcClient;
use crate::types::{
    ClientMessage, DatabaseReplicas, ServerMessage, SessionId, SessionOpenReq, SessionOpenRes,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt, TryStreamExt};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tarpc::client::Config as TarpcConfig;
use tarpc::context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_serde::formats::Bincode;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info};

/// Preamble of the stream carrying unary RPCs
pub const STREAM_KIND_RPC: u8 = 0x01;

/// Preamble of a transaction stream
pub const STREAM_KIND_TRANSACTION: u8 = 0x02;

/// Opens QUIC connections sharing one client endpoint
pub struct QuicConnector {
    config: ClientConfig,
    endpoint: quinn::Endpoint,
}

impl QuicConnector {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = make_client_endpoint(&config)?;
        Ok(Self { config, endpoint })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn NodeConnection>> {
        let connection = QuicNodeConnection::connect(&self.endpoint, address, &self.config).await?;
        Ok(Arc::new(connection))
    }
}

/// Connection to one server over QUIC
pub struct QuicNodeConnection {
    address: String,
    connection: quinn::Connection,
    rpc: QuiverRpcClient,
    request_timeout: Duration,
}

impl QuicNodeConnection {
    /// Connect to `address` and start the RPC client
    pub async fn connect(
        endpoint: &quinn::Endpoint,
        address: &str,
        config: &ClientConfig,
    ) -> Result<Self> {
        let sock_addr = resolve(address)?;
        debug!("Connecting to server at {}", address);

        let connecting = endpoint
            .connect(sock_addr, &config.server_name)
            .map_err(|e| {
                record_connection_failed(address, "connect_error");
                Error::unreachable(address, format!("failed to connect: {}", e))
            })?;

        let connection = tokio::time::timeout(config.connect_timeout(), connecting)
            .await
            .map_err(|_| {
                record_connection_failed(address, "timeout");
                Error::unreachable(address, "connection timed out")
            })?
            .map_err(|e| {
                record_connection_failed(address, "handshake_error");
                Error::unreachable(address, format!("connection handshake failed: {}", e))
            })?;

        let stream = open_stream(&connection, address, STREAM_KIND_RPC).await?;
        let transport = tarpc::serde_transport::new(
            Framed::new(stream, tarpc::tokio_util::codec::LengthDelimitedCodec::new()),
            tarpc::tokio_serde::formats::Bincode::default(),
        );
        let rpc = QuiverRpcClient::new(TarpcConfig::default(), transport).spawn();

        info!("Connected to server at {}", address);
        record_connection_established(address);

        Ok(Self {
            address: address.to_string(),
            connection,
            rpc,
            request_timeout: config.request_timeout(),
        })
    }

    /// Create a context with the configured request timeout
    fn context(&self) -> context::Context {
        let mut ctx = context::current();
        ctx.deadline = std::time::Instant::now() + self.request_timeout;
        ctx
    }

    fn rpc_error(&self, err: tarpc::client::RpcError) -> Error {
        Error::unreachable(self.address.clone(), err)
    }

    /// Run one RPC, timing it and classifying the outcome
    async fn call<T, F>(&self, method: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<Result<T>, tarpc::client::RpcError>>,
    {
        let timer = RpcTimer::new(method, &self.address);
        let res = fut.await.map_err(|e| self.rpc_error(e)).and_then(|r| r);
        match &res {
            Ok(_) => timer.success(),
            Err(e) => timer.error(e.error_type()),
        }
        res
    }
}

#[async_trait]
impl NodeConnection for QuicNodeConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn session_open(&self, req: SessionOpenReq) -> Result<SessionOpenRes> {
        let fut = self.rpc.session_open(self.context(), req);
        self.call("session_open", async { fut.await.map(|r| r.map_err(Error::from)) })
            .await
    }

    async fn session_pulse(&self, session_id: &SessionId) -> Result<bool> {
        let fut = self.rpc.session_pulse(self.context(), session_id.clone());
        self.call("session_pulse", async { fut.await.map(Ok) }).await
    }

    async fn session_close(&self, session_id: &SessionId) -> Result<()> {
        let fut = self.rpc.session_close(self.context(), session_id.clone());
        self.call("session_close", async { fut.await.map(|r| r.map_err(Error::from)) })
            .await
    }

    async fn transaction_stream(&self) -> Result<TransactionChannel> {
        let stream = open_stream(&self.connection, &self.address, STREAM_KIND_TRANSACTION).await?;
        let framed = tokio_serde::Framed::new(
            Framed::new(stream, LengthDelimitedCodec::new()),
            Bincode::<ServerMessage, ClientMessage>::default(),
        );
        let (sink, inbound) = StreamExt::split::<ClientMessage>(framed);

        let sink_addr = self.address.clone();
        let stream_addr = self.address.clone();
        Ok(TransactionChannel::new(
            sink.sink_map_err(move |e| Error::unreachable(sink_addr.clone(), e)),
            inbound.map_err(move |e| Error::unreachable(stream_addr.clone(), e)),
        ))
    }

    async fn servers_all(&self) -> Result<Vec<String>> {
        let fut = self.rpc.servers_all(self.context());
        self.call("servers_all", async { fut.await.map(Ok) }).await
    }

    async fn database_replicas(&self, database: &str) -> Result<DatabaseReplicas> {
        let fut = self.rpc.database_replicas(self.context(), database.to_string());
        self.call("database_replicas", async {
            fut.await.map(|r| r.map_err(Error::from))
        })
        .await
    }

    async fn databases_all(&self) -> Result<Vec<DatabaseReplicas>> {
        let fut = self.rpc.databases_all(self.context());
        self.call("databases_all", async { fut.await.map(Ok) }).await
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("Invalid address '{}': {}", address, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("Address '{}' did not resolve", address)))
}

async fn open_stream(
    connection: &quinn::Connection,
    address: &str,
    kind: u8,
) -> Result<QuicBiStream> {
    let (mut send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| Error::unreachable(address, format!("failed to open stream: {}", e)))?;
    send.write_all(&[kind])
        .await
        .map_err(|e| Error::unreachable(address, format!("failed to write preamble: {}", e)))?;
    Ok(QuicBiStream { send, recv })
}

/// Wrapper around QUIC bidirectional streams for tokio I/O
struct QuicBiStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for QuicBiStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicBiStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}
