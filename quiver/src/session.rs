//! Sessions
//!
//! A session is opened against one server and kept alive by a periodic
//! pulse. It is the factory for transactions.
//!
//! ```text
//! Open → Closed
//!
//! Transitions:
//!   explicit close()        → server notified once, pulse cancelled
//!   pulse reports not alive → closed locally, pulse stops
//! ```

use crate::config::ClientConfig;
use crate::connection::NodeConnection;
use crate::error::{Error, Result};
use crate::metrics::{self, RpcTimer};
use crate::transaction::Transaction;
use crate::types::{
    SessionId, SessionOpenReq, SessionOptions, SessionType, TransactionOptions, TransactionType,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Open sessions owned by one client, keyed by session id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write();
        sessions.insert(session.id.clone(), session);
        metrics::record_open_sessions(sessions.len());
    }

    fn remove(&self, id: &SessionId) {
        let mut sessions = self.sessions.write();
        sessions.remove(id);
        metrics::record_open_sessions(sessions.len());
    }

    /// Close every registered session
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
    }

    /// Close every registered session without waiting for the servers.
    ///
    /// Sessions are notified from a spawned task when a runtime is
    /// available, and only closed locally otherwise.
    pub fn close_all_in_background(&self) {
        if self.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.clone();
                handle.spawn(async move { registry.close_all().await });
            }
            Err(_) => {
                let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
                for session in sessions {
                    session.transition_to_closed();
                }
            }
        }
    }
}

/// A session on one server
pub struct Session {
    connection: Arc<dyn NodeConnection>,
    database: String,
    session_type: SessionType,
    options: SessionOptions,
    id: SessionId,
    network_latency: Duration,
    config: ClientConfig,
    is_open: AtomicBool,
    /// Shared by transaction opens, exclusive for close
    close_lock: tokio::sync::RwLock<()>,
    pulse_cancel: CancellationToken,
    registry: SessionRegistry,
}

impl Session {
    /// Open a session, register it and start its pulse
    pub async fn open(
        connection: Arc<dyn NodeConnection>,
        database: &str,
        session_type: SessionType,
        options: SessionOptions,
        config: &ClientConfig,
        registry: &SessionRegistry,
    ) -> Result<Arc<Self>> {
        let timer = RpcTimer::new("session_open", connection.address());
        let req = SessionOpenReq {
            database: database.to_string(),
            session_type,
            options: options.clone(),
        };
        let res = match connection.session_open(req).await {
            Ok(res) => res,
            Err(e) => {
                timer.error(e.error_type());
                return Err(e);
            }
        };
        let network_latency = timer.elapsed().saturating_sub(res.server_duration());
        timer.success();

        let session = Arc::new(Self {
            connection,
            database: database.to_string(),
            session_type,
            options,
            id: res.session_id,
            network_latency,
            config: config.clone(),
            is_open: AtomicBool::new(true),
            close_lock: tokio::sync::RwLock::new(()),
            pulse_cancel: CancellationToken::new(),
            registry: registry.clone(),
        });

        registry.insert(Arc::clone(&session));
        session.spawn_pulse();

        info!(
            address = %session.address(),
            database = %database,
            session_id = %session.id,
            latency_ms = network_latency.as_millis() as u64,
            "Opened session"
        );
        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn address(&self) -> &str {
        self.connection.address()
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Estimated one-way latency to the server
    pub fn network_latency(&self) -> Duration {
        self.network_latency
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    /// Open a transaction bound to this session
    pub async fn transaction(
        &self,
        transaction_type: TransactionType,
        options: TransactionOptions,
    ) -> Result<Transaction> {
        let _guard = self.close_lock.read().await;
        if !self.is_open() {
            return Err(Error::SessionClosed);
        }

        Transaction::open(
            self.connection.as_ref(),
            &self.id,
            transaction_type,
            options,
            self.network_latency,
            &self.config,
        )
        .await
    }

    /// Close the session. Only the first call tears down; the server is
    /// notified best-effort.
    pub async fn close(&self) {
        let _guard = self.close_lock.write().await;
        if !self.transition_to_closed() {
            return;
        }

        match self.connection.session_close(&self.id).await {
            Ok(()) => debug!(session_id = %self.id, "Closed session"),
            Err(e) => debug!(
                session_id = %self.id,
                error = %e,
                "Server did not acknowledge session close"
            ),
        }
    }

    /// Flip to closed, stop the pulse and unregister. Returns false if the
    /// session was already closed.
    fn transition_to_closed(&self) -> bool {
        if self
            .is_open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.pulse_cancel.cancel();
        self.registry.remove(&self.id);
        true
    }

    fn spawn_pulse(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let cancel = self.pulse_cancel.clone();
        let interval = self.config.pulse_interval();
        tokio::spawn(pulse_loop(session, cancel, interval));
    }
}

async fn pulse_loop(session: Weak<Session>, cancel: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(session) = session.upgrade() else {
            break;
        };
        if !session.is_open() {
            break;
        }

        let alive = tokio::select! {
            _ = cancel.cancelled() => break,
            alive = session.connection.session_pulse(&session.id) => alive,
        };

        match alive {
            Ok(true) => metrics::record_pulse("alive"),
            Ok(false) => {
                metrics::record_pulse("dead");
                let _guard = session.close_lock.write().await;
                if session.transition_to_closed() {
                    warn!(
                        session_id = %session.id,
                        address = %session.address(),
                        "Server reports session is no longer alive, closing"
                    );
                }
                break;
            }
            Err(e) => {
                metrics::record_pulse("error");
                warn!(session_id = %session.id, error = %e, "Session pulse failed");
            }
        }
    }
    debug!("Session pulse stopped");
}
