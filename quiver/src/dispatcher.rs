//! Request dispatcher
//!
//! One background worker per transaction stream owns the outbound sink.
//! Requests are written in the order they were enqueued; batched requests
//! wait up to the dispatch interval so several of them share a frame.

use crate::connection::MessageSink;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{ClientMessage, TransactionReq};
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

enum Command {
    Batched(TransactionReq),
    Immediate(TransactionReq),
    /// End-of-stream sentinel
    Close,
}

/// Serializes outgoing requests onto a transaction stream
pub struct RequestDispatcher {
    tx: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
}

impl RequestDispatcher {
    /// Spawn the writer worker. `on_error` is called once if writing fails.
    pub fn spawn<F>(sink: MessageSink, dispatch_interval: Duration, on_error: F) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(e) = run_writer(sink, rx, dispatch_interval).await {
                debug!(error = %e, "Request dispatcher stopped on write failure");
                on_error(e);
            }
        });

        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a request for the next batch
    pub fn dispatch(&self, req: TransactionReq) -> Result<()> {
        self.send(Command::Batched(req))
    }

    /// Send a request now, together with anything queued before it
    pub fn dispatch_now(&self, req: TransactionReq) -> Result<()> {
        self.send(Command::Immediate(req))
    }

    /// Flush what is queued and end the outbound stream. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Command::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransactionClosed);
        }
        self.tx.send(command).map_err(|_| Error::TransactionClosed)
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_writer(
    mut sink: MessageSink,
    mut rx: mpsc::UnboundedReceiver<Command>,
    dispatch_interval: Duration,
) -> Result<()> {
    let mut pending: Vec<TransactionReq> = Vec::new();
    let mut flush_at: Option<Instant> = None;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Batched(req)) => {
                    pending.push(req);
                    if flush_at.is_none() {
                        flush_at = Some(Instant::now() + dispatch_interval);
                    }
                }
                Some(Command::Immediate(req)) => {
                    pending.push(req);
                    flush(&mut sink, &mut pending).await?;
                    flush_at = None;
                }
                Some(Command::Close) | None => {
                    flush(&mut sink, &mut pending).await?;
                    // The peer may already be gone; the stream is finished either way.
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
            _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                flush(&mut sink, &mut pending).await?;
                flush_at = None;
            }
        }
    }
}

async fn flush(sink: &mut MessageSink, pending: &mut Vec<TransactionReq>) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let reqs = std::mem::take(pending);
    metrics::record_batch_flushed(reqs.len());
    sink.send(ClientMessage { reqs }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RequestId, TransactionReqBody};
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    fn sink_pair() -> (MessageSink, fmpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = fmpsc::unbounded();
        let sink = tx.sink_map_err(|e| Error::unreachable("test", e));
        (Box::pin(sink), rx)
    }

    fn req() -> TransactionReq {
        TransactionReq {
            req_id: RequestId::new(),
            body: TransactionReqBody::Commit,
        }
    }

    #[tokio::test]
    async fn test_batched_requests_share_a_frame() {
        let (sink, mut rx) = sink_pair();
        let dispatcher = RequestDispatcher::spawn(sink, Duration::from_millis(20), |_| {});

        let (a, b, c) = (req(), req(), req());
        dispatcher.dispatch(a.clone()).unwrap();
        dispatcher.dispatch(b.clone()).unwrap();
        dispatcher.dispatch(c.clone()).unwrap();

        let frame = rx.next().await.unwrap();
        assert_eq!(frame.reqs, vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_immediate_flushes_queued_requests_in_order() {
        let (sink, mut rx) = sink_pair();
        let dispatcher = RequestDispatcher::spawn(sink, Duration::from_secs(60), |_| {});

        let (a, b) = (req(), req());
        dispatcher.dispatch(a.clone()).unwrap();
        dispatcher.dispatch_now(b.clone()).unwrap();

        let frame = rx.next().await.unwrap();
        assert_eq!(frame.reqs, vec![a, b]);
    }

    #[tokio::test]
    async fn test_close_flushes_and_ends_stream() {
        let (sink, mut rx) = sink_pair();
        let dispatcher = RequestDispatcher::spawn(sink, Duration::from_secs(60), |_| {});

        let a = req();
        dispatcher.dispatch(a.clone()).unwrap();
        dispatcher.close();
        dispatcher.close();

        assert_eq!(rx.next().await.unwrap().reqs, vec![a]);
        assert!(rx.next().await.is_none());
        assert_eq!(dispatcher.dispatch(req()).unwrap_err(), Error::TransactionClosed);
    }

    #[tokio::test]
    async fn test_write_failure_reports_error() {
        let (sink, rx) = sink_pair();
        drop(rx);
        let (err_tx, err_rx) = tokio::sync::oneshot::channel();
        let dispatcher = RequestDispatcher::spawn(sink, Duration::from_millis(1), move |e| {
            let _ = err_tx.send(e);
        });

        dispatcher.dispatch_now(req()).unwrap();

        let err = err_rx.await.unwrap();
        assert!(err.is_unreachable());
    }
}
