//! Cluster sessions
//!
//! A cluster session wraps a single-node session on one replica. When a
//! transaction has to be retried on another replica, the stale session is
//! closed and a new one is opened there first. Concurrent failovers share
//! the replacement: only the first caller swaps the session, the others
//! reuse what it opened.

use crate::client::ClusterContext;
use crate::failsafe::FailsafeTask;
use crate::replica::Replica;
use async_trait::async_trait;
use parking_lot::Mutex;
use quiver::{
    Error, Result, Session, SessionOptions, SessionType, Transaction, TransactionOptions,
    TransactionType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Session against a replicated database
pub struct ClusterSession {
    context: Arc<ClusterContext>,
    database: String,
    session_type: SessionType,
    options: SessionOptions,
    is_open: AtomicBool,
    current: Mutex<(Replica, Arc<Session>)>,
    /// Held while the current session is checked or replaced
    replace_lock: tokio::sync::Mutex<()>,
}

impl ClusterSession {
    pub(crate) fn new(
        context: Arc<ClusterContext>,
        database: &str,
        session_type: SessionType,
        options: SessionOptions,
        replica: Replica,
        session: Arc<Session>,
    ) -> Self {
        Self {
            context,
            database: database.to_string(),
            session_type,
            options,
            is_open: AtomicBool::new(true),
            current: Mutex::new((replica, session)),
            replace_lock: tokio::sync::Mutex::new(()),
        }
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

    /// Replica the session currently lives on
    pub fn replica(&self) -> Replica {
        self.current.lock().0.clone()
    }

    /// Underlying single-node session
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.current.lock().1)
    }

    /// False once the session or its client was closed. A lost single-node
    /// session does not count: the next transaction replaces it.
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst) && !self.context.is_closed()
    }

    /// Open a transaction, failing over to another replica when needed
    pub async fn transaction(
        &self,
        transaction_type: TransactionType,
        options: TransactionOptions,
    ) -> Result<Transaction> {
        if !self.is_open() {
            return Err(Error::SessionClosed);
        }

        let task = TransactionTask {
            session: self,
            transaction_type,
            options,
            attempted: Mutex::new(None),
        };
        self.context
            .run_failsafe(&self.database, self.options.read_any_replica, &task)
            .await
    }

    /// Close the session. Only the first call reaches the server.
    pub async fn close(&self) {
        if self
            .is_open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let _guard = self.replace_lock.lock().await;
        self.session().close().await;
    }

    /// Session to use on `replica`.
    ///
    /// An open current session on `replica` is reused unless it is the one
    /// `failed` on. Otherwise it is closed and replaced.
    async fn session_on(
        &self,
        replica: &Replica,
        failed: Option<&Arc<Session>>,
    ) -> Result<Arc<Session>> {
        let _guard = self.replace_lock.lock().await;
        if !self.is_open() {
            return Err(Error::SessionClosed);
        }

        let (current_replica, current) = self.current.lock().clone();
        let failed_here = failed.is_some_and(|f| Arc::ptr_eq(f, &current));
        if current_replica.id == replica.id && current.is_open() && !failed_here {
            return Ok(current);
        }

        current.close().await;
        let fresh = self
            .context
            .open_session(replica, self.session_type, &self.options)
            .await?;
        *self.current.lock() = (replica.clone(), Arc::clone(&fresh));

        info!(
            database = %self.database,
            from = %current_replica.id.address,
            to = %replica.id.address,
            "Moved session to another replica"
        );
        Ok(fresh)
    }
}

struct TransactionTask<'a> {
    session: &'a ClusterSession,
    transaction_type: TransactionType,
    options: TransactionOptions,
    /// Session the previous attempt ran on
    attempted: Mutex<Option<Arc<Session>>>,
}

#[async_trait]
impl<'a> FailsafeTask for TransactionTask<'a> {
    type Output = Transaction;

    async fn run(&self, replica: &Replica) -> Result<Transaction> {
        let failed = self.attempted.lock().take();
        let session = self.session.session_on(replica, failed.as_ref()).await?;
        *self.attempted.lock() = Some(Arc::clone(&session));
        session
            .transaction(self.transaction_type, self.options.clone())
            .await
    }
}
