//! In-memory server doubles for tests
//!
//! `MockNode` implements [`NodeConnection`] without any I/O. Transaction
//! streams are served by a small task that understands:
//!
//! - `Open`, `Commit`, `Rollback`: answered with a response of the same name
//! - payload kind `"stream"`: `payload[0]` data parts, then `Done`
//! - payload kind `"fail"`: a domain error carrying the payload as text
//! - any other payload kind: echoed back as the response

use crate::connection::{Connector, NodeConnection, TransactionChannel};
use crate::error::{Error, Result};
use crate::types::{
    ClientMessage, DatabaseReplicas, ReplicaInfo, ResPart, Response, ServerError, ServerMessage,
    SessionId, SessionOpenReq, SessionOpenRes, TransactionReq, TransactionReqBody,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    reachable: bool,
    servers: Vec<String>,
    replicas: HashMap<String, Vec<ReplicaInfo>>,
    reported_names: HashMap<String, String>,
    sessions: HashMap<SessionId, bool>,
    next_session: u64,
    server_duration_ms: u64,
    session_open_error: Option<Error>,
    transaction_open_error: Option<ServerError>,
    transaction_open_delay_ms: u64,
    session_opens: usize,
    session_closes: usize,
    pulses: usize,
    transaction_opens: usize,
    last_network_latency_ms: Option<u64>,
}

/// Scriptable stand-in for one server
#[derive(Clone)]
pub struct MockNode {
    address: String,
    state: Arc<Mutex<MockState>>,
}

impl MockNode {
    pub fn new(address: &str) -> Self {
        let state = MockState {
            reachable: true,
            servers: vec![address.to_string()],
            ..Default::default()
        };
        Self {
            address: address.to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Member list returned by `servers_all`
    pub fn set_servers(&self, servers: &[&str]) {
        self.state.lock().servers = servers.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_replicas(&self, database: &str, replicas: Vec<ReplicaInfo>) {
        self.state.lock().replicas.insert(database.to_string(), replicas);
    }

    /// Answer replica requests for `database` under another name
    pub fn set_reported_name(&self, database: &str, reported: &str) {
        self.state
            .lock()
            .reported_names
            .insert(database.to_string(), reported.to_string());
    }

    pub fn set_server_duration_ms(&self, ms: u64) {
        self.state.lock().server_duration_ms = ms;
    }

    pub fn set_session_open_error(&self, error: Option<Error>) {
        self.state.lock().session_open_error = error;
    }

    pub fn set_transaction_open_error(&self, error: Option<ServerError>) {
        self.state.lock().transaction_open_error = error;
    }

    /// Hold every transaction open answer back for `ms`
    pub fn set_transaction_open_delay_ms(&self, ms: u64) {
        self.state.lock().transaction_open_delay_ms = ms;
    }

    /// Forget every session, so the next pulse reports not alive
    pub fn expire_sessions(&self) {
        for alive in self.state.lock().sessions.values_mut() {
            *alive = false;
        }
    }

    pub fn session_opens(&self) -> usize {
        self.state.lock().session_opens
    }

    pub fn session_closes(&self) -> usize {
        self.state.lock().session_closes
    }

    pub fn pulses(&self) -> usize {
        self.state.lock().pulses
    }

    pub fn transaction_opens(&self) -> usize {
        self.state.lock().transaction_opens
    }

    pub fn last_network_latency_ms(&self) -> Option<u64> {
        self.state.lock().last_network_latency_ms
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    fn check_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(Error::unreachable(self.address.clone(), "connection refused"))
        }
    }

    fn respond(&self, req: TransactionReq) -> Vec<ServerMessage> {
        let req_id = req.req_id;
        let res = |res: std::result::Result<Response, ServerError>| ServerMessage::Res { req_id, res };

        match req.body {
            TransactionReqBody::Open(open) => {
                let mut state = self.state.lock();
                if let Some(err) = state.transaction_open_error.clone() {
                    return vec![res(Err(err))];
                }
                state.transaction_opens += 1;
                state.last_network_latency_ms = Some(open.network_latency_ms);
                vec![res(Ok(Response::new("open", Vec::new())))]
            }
            TransactionReqBody::Commit => vec![res(Ok(Response::new("commit", Vec::new())))],
            TransactionReqBody::Rollback => vec![res(Ok(Response::new("rollback", Vec::new())))],
            TransactionReqBody::StreamContinue => Vec::new(),
            TransactionReqBody::Payload(request) => match request.kind.as_str() {
                "stream" => {
                    let count = request.payload.first().copied().unwrap_or(0);
                    let mut parts: Vec<ServerMessage> = (0..count)
                        .map(|i| ServerMessage::ResPart {
                            req_id,
                            part: ResPart::Data(Response::new("part", vec![i])),
                        })
                        .collect();
                    parts.push(ServerMessage::ResPart {
                        req_id,
                        part: ResPart::Done,
                    });
                    parts
                }
                "fail" => {
                    let message = String::from_utf8_lossy(&request.payload).into_owned();
                    vec![res(Err(ServerError::domain(message)))]
                }
                _ => vec![res(Ok(Response::new(request.kind, request.payload)))],
            },
        }
    }
}

async fn serve_transaction(
    node: MockNode,
    mut requests: mpsc::UnboundedReceiver<ClientMessage>,
    responses: mpsc::UnboundedSender<Result<ServerMessage>>,
) {
    while let Some(frame) = requests.next().await {
        for req in frame.reqs {
            if matches!(req.body, TransactionReqBody::Open(_)) {
                let delay = node.state.lock().transaction_open_delay_ms;
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
            for message in node.respond(req) {
                if responses.unbounded_send(Ok(message)).is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl NodeConnection for MockNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn session_open(&self, _req: SessionOpenReq) -> Result<SessionOpenRes> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if let Some(err) = state.session_open_error.clone() {
            return Err(err);
        }
        state.session_opens += 1;
        state.next_session += 1;
        let session_id = SessionId(state.next_session.to_be_bytes().to_vec());
        state.sessions.insert(session_id.clone(), true);
        Ok(SessionOpenRes {
            session_id,
            server_duration_ms: state.server_duration_ms,
        })
    }

    async fn session_pulse(&self, session_id: &SessionId) -> Result<bool> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.pulses += 1;
        Ok(state.sessions.get(session_id).copied().unwrap_or(false))
    }

    async fn session_close(&self, session_id: &SessionId) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.session_closes += 1;
        state.sessions.remove(session_id);
        Ok(())
    }

    async fn transaction_stream(&self) -> Result<TransactionChannel> {
        self.check_reachable()?;
        let (req_tx, req_rx) = mpsc::unbounded();
        let (res_tx, res_rx) = mpsc::unbounded();
        tokio::spawn(serve_transaction(self.clone(), req_rx, res_tx));

        let address = self.address.clone();
        Ok(TransactionChannel::new(
            req_tx.sink_map_err(move |e| Error::unreachable(address.clone(), e)),
            res_rx,
        ))
    }

    async fn servers_all(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        Ok(self.state.lock().servers.clone())
    }

    async fn database_replicas(&self, database: &str) -> Result<DatabaseReplicas> {
        self.check_reachable()?;
        let state = self.state.lock();
        match state.replicas.get(database) {
            Some(replicas) => Ok(DatabaseReplicas {
                name: state
                    .reported_names
                    .get(database)
                    .cloned()
                    .unwrap_or_else(|| database.to_string()),
                replicas: replicas.clone(),
            }),
            None => Err(Error::Domain(format!("database '{}' does not exist", database))),
        }
    }

    async fn databases_all(&self) -> Result<Vec<DatabaseReplicas>> {
        self.check_reachable()?;
        let state = self.state.lock();
        let mut all: Vec<DatabaseReplicas> = state
            .replicas
            .iter()
            .map(|(name, replicas)| DatabaseReplicas {
                name: name.clone(),
                replicas: replicas.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

/// Connector over a fixed set of mock nodes
#[derive(Clone, Default)]
pub struct MockConnector {
    nodes: Arc<Mutex<HashMap<String, MockNode>>>,
    connects: Arc<Mutex<usize>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return a handle for scripting it
    pub fn add_node(&self, address: &str) -> MockNode {
        let node = MockNode::new(address);
        self.nodes.lock().insert(address.to_string(), node.clone());
        node
    }

    pub fn node(&self, address: &str) -> Option<MockNode> {
        self.nodes.lock().get(address).cloned()
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn NodeConnection>> {
        *self.connects.lock() += 1;
        let node = self
            .node(address)
            .ok_or_else(|| Error::unreachable(address, "no such host"))?;
        node.check_reachable()?;
        Ok(Arc::new(node))
    }
}

/// Build a replica description
pub fn replica(address: &str, term: u64, is_primary: bool, is_preferred: bool) -> ReplicaInfo {
    ReplicaInfo {
        address: address.to_string(),
        term,
        is_primary,
        is_preferred,
    }
}
