//! Correlation registry
//!
//! Maps a request id to the slot its response(s) must be delivered to. A
//! connection keeps one registry for unary responses and one for streamed
//! response parts.

use crate::error::{Error, Result};
use crate::types::{RequestId, ResPart, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Values that may end the life of a slot
pub trait Terminal {
    /// Whether no further value will follow this one for the same request id
    fn is_terminal(&self) -> bool;
}

impl Terminal for Response {
    fn is_terminal(&self) -> bool {
        true
    }
}

impl Terminal for ResPart {
    fn is_terminal(&self) -> bool {
        matches!(self, ResPart::Done | ResPart::Failure(_))
    }
}

pub type SlotSender<T> = mpsc::UnboundedSender<Result<T>>;

/// Receiving end of a registered slot, owned by the caller awaiting it
#[derive(Debug)]
pub struct Slot<T> {
    id: RequestId,
    rx: mpsc::UnboundedReceiver<Result<T>>,
}

impl<T> Slot<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the next value. `None` means the registry dropped the slot
    /// without delivering anything.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        self.rx.poll_recv(cx)
    }

    /// Next value already delivered, without waiting
    pub fn try_recv(&mut self) -> Option<Result<T>> {
        self.rx.try_recv().ok()
    }
}

struct Inner<T> {
    slots: HashMap<RequestId, SlotSender<T>>,
    /// Set once by `close_all`; new registrations fail with it
    closed: Option<Error>,
}

/// Thread-safe map from request id to delivery slot
pub struct ResponseCollector<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Terminal> ResponseCollector<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Register a fresh slot for `id`
    pub fn new_slot(&self, id: RequestId) -> Result<Slot<T>> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        if inner.slots.contains_key(&id) {
            return Err(Error::DuplicateRequestId(id));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.slots.insert(id, tx);
        Ok(Slot { id, rx })
    }

    /// Deliver a value to the slot for `id`.
    ///
    /// Terminal values and errors remove the slot. Delivering to an id that
    /// was never registered (or already finished) is `UnknownRequestId`.
    pub fn put(&self, id: RequestId, value: Result<T>) -> Result<()> {
        let terminal = match &value {
            Ok(v) => v.is_terminal(),
            Err(_) => true,
        };

        let tx = {
            let mut inner = self.inner.lock();
            if terminal {
                inner.slots.remove(&id)
            } else {
                inner.slots.get(&id).cloned()
            }
        };

        match tx {
            // The caller may have stopped listening; that is not an error.
            Some(tx) => {
                let _ = tx.send(value);
                Ok(())
            }
            None => Err(Error::UnknownRequestId(id)),
        }
    }

    /// Sending handle for a registered slot
    pub fn get(&self, id: RequestId) -> Option<SlotSender<T>> {
        self.inner.lock().slots.get(&id).cloned()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.inner.lock().slots.contains_key(&id)
    }

    /// Drop a slot without delivering anything
    pub fn remove(&self, id: RequestId) -> bool {
        self.inner.lock().slots.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every outstanding slot with `error` and refuse new ones
    pub fn close_all(&self, error: Error) {
        let slots: Vec<SlotSender<T>> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(error.clone());
            }
            inner.slots.drain().map(|(_, tx)| tx).collect()
        };

        for tx in slots {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

impl<T: Terminal> Default for ResponseCollector<T> {
    fn default() -> Self {
        Self::new()
    }
}
