//! Bidirectional stream multiplexer
//!
//! Many logically concurrent requests share one transaction stream. Each
//! request gets a fresh id; a background reader owns the inbound half and
//! routes every server message to the slot registered for its id, so
//! callers only ever wait on their own slot.

use crate::connection::{MessageStream, TransactionChannel};
use crate::dispatcher::RequestDispatcher;
use crate::error::{Error, Result};
use crate::registry::{ResponseCollector, Slot};
use crate::types::{RequestId, ResPart, Response, ServerMessage, TransactionReq, TransactionReqBody};
use futures::stream::FusedStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Shared {
    address: String,
    is_open: AtomicBool,
    singles: ResponseCollector<Response>,
    parts: ResponseCollector<ResPart>,
    /// Streamed requests whose consumer went away before `Done`
    abandoned: Mutex<HashSet<RequestId>>,
    dispatcher: RequestDispatcher,
    reader_cancel: CancellationToken,
}

impl Shared {
    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn close(&self, error: Option<Error>) {
        if self
            .is_open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let error = match error {
            Some(err) => {
                warn!(address = %self.address, error = %err, "Transaction stream failed");
                err
            }
            None => {
                debug!(address = %self.address, "Transaction stream closed");
                Error::TransactionClosed
            }
        };

        self.singles.close_all(error.clone());
        self.parts.close_all(error);
        self.dispatcher.close();
        self.reader_cancel.cancel();
    }

    /// Route one inbound message to the slot waiting for it
    fn deliver(&self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Res { req_id, res } => {
                // A streamed request may be rejected with a unary failure
                if res.is_err() && !self.singles.contains(req_id) {
                    let mut abandoned = self.abandoned.lock();
                    if abandoned.remove(&req_id) {
                        return Ok(());
                    }
                    if self.parts.contains(req_id) {
                        return self.parts.put(req_id, res.map(ResPart::Data).map_err(Error::from));
                    }
                }
                self.singles.put(req_id, res.map_err(Error::from))
            }
            ServerMessage::ResPart { req_id, part } => {
                let mut abandoned = self.abandoned.lock();
                if abandoned.contains(&req_id) {
                    // Nobody reads these parts; keep the server moving until it ends
                    return match part {
                        ResPart::Data(_) => Ok(()),
                        ResPart::Continue => self.dispatcher.dispatch_now(continue_req(req_id)),
                        ResPart::Done | ResPart::Failure(_) => {
                            abandoned.remove(&req_id);
                            Ok(())
                        }
                    };
                }
                let value = match part {
                    ResPart::Failure(err) => Err(Error::from(err)),
                    part => Ok(part),
                };
                self.parts.put(req_id, value)
            }
            ServerMessage::Failure(err) => Err(Error::from(err)),
        }
    }
}

fn continue_req(req_id: RequestId) -> TransactionReq {
    TransactionReq {
        req_id,
        body: TransactionReqBody::StreamContinue,
    }
}

async fn read_loop(shared: Arc<Shared>, mut inbound: MessageStream) {
    let cancel = shared.reader_cancel.clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                if let Err(err) = shared.deliver(message) {
                    shared.close(Some(err));
                    break;
                }
            }
            Some(Err(err)) => {
                shared.close(Some(err));
                break;
            }
            None => {
                shared.close(Some(Error::unreachable(
                    shared.address.clone(),
                    "stream closed by server",
                )));
                break;
            }
        }
    }
}

/// Multiplexer over one transaction stream
pub struct BidirectionalStream {
    shared: Arc<Shared>,
}

impl BidirectionalStream {
    /// Take ownership of a channel and start its reader and writer workers
    pub fn new(address: &str, channel: TransactionChannel, dispatch_interval: Duration) -> Self {
        let TransactionChannel { sink, stream } = channel;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let dispatcher = RequestDispatcher::spawn(sink, dispatch_interval, move |err| {
                if let Some(shared) = weak.upgrade() {
                    shared.close(Some(err));
                }
            });

            Shared {
                address: address.to_string(),
                is_open: AtomicBool::new(true),
                singles: ResponseCollector::new(),
                parts: ResponseCollector::new(),
                abandoned: Mutex::new(HashSet::new()),
                dispatcher,
                reader_cancel: CancellationToken::new(),
            }
        });

        tokio::spawn(read_loop(Arc::clone(&shared), stream));

        Self { shared }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Send a request expecting one terminal response.
    ///
    /// With `batch` the request waits for the next batch flush; otherwise it
    /// is written immediately.
    pub fn single(&self, body: TransactionReqBody, batch: bool) -> Result<ResponseFuture> {
        if !self.shared.is_open() {
            return Err(Error::TransactionClosed);
        }

        let req_id = RequestId::new();
        let slot = self.shared.singles.new_slot(req_id)?;
        if let Err(err) = self.send(TransactionReq { req_id, body }, batch) {
            self.shared.singles.remove(req_id);
            return Err(err);
        }

        Ok(ResponseFuture { slot })
    }

    /// Send a request answered by a sequence of response parts
    pub fn stream(&self, body: TransactionReqBody) -> Result<ResponseParts> {
        if !self.shared.is_open() {
            return Err(Error::TransactionClosed);
        }

        let req_id = RequestId::new();
        let slot = self.shared.parts.new_slot(req_id)?;
        if let Err(err) = self.send(TransactionReq { req_id, body }, true) {
            self.shared.parts.remove(req_id);
            return Err(err);
        }

        Ok(ResponseParts {
            slot,
            shared: Arc::clone(&self.shared),
            done: false,
        })
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Close the stream, failing every pending request with `error`, or with
    /// `TransactionClosed` when no error is given. Idempotent.
    pub fn close(&self, error: Option<Error>) {
        self.shared.close(error);
    }

    fn send(&self, req: TransactionReq, batch: bool) -> Result<()> {
        if batch {
            self.shared.dispatcher.dispatch(req)
        } else {
            self.shared.dispatcher.dispatch_now(req)
        }
    }
}

impl Drop for BidirectionalStream {
    fn drop(&mut self) {
        self.shared.close(None);
    }
}

/// Resolves to the single response of a request
#[must_use = "the response is only observed by awaiting the future"]
pub struct ResponseFuture {
    slot: Slot<Response>,
}

impl ResponseFuture {
    pub fn request_id(&self) -> RequestId {
        self.slot.id()
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.slot.poll_recv(cx)) {
            Some(res) => Poll::Ready(res),
            None => Poll::Ready(Err(Error::TransactionClosed)),
        }
    }
}

/// Lazy sequence of response parts, finished by the server's `Done`
pub struct ResponseParts {
    slot: Slot<ResPart>,
    shared: Arc<Shared>,
    done: bool,
}

impl ResponseParts {
    pub fn request_id(&self) -> RequestId {
        self.slot.id()
    }

    fn finish(&mut self, item: Option<Result<Response>>) -> Poll<Option<Result<Response>>> {
        self.done = true;
        Poll::Ready(item)
    }
}

impl Stream for ResponseParts {
    type Item = Result<Response>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            match ready!(this.slot.poll_recv(cx)) {
                Some(Ok(ResPart::Data(res))) => return Poll::Ready(Some(Ok(res))),
                Some(Ok(ResPart::Continue)) => {
                    let req = continue_req(this.slot.id());
                    if let Err(err) = this.shared.dispatcher.dispatch_now(req) {
                        return this.finish(Some(Err(err)));
                    }
                }
                Some(Ok(ResPart::Done)) => return this.finish(None),
                Some(Ok(ResPart::Failure(err))) => return this.finish(Some(Err(err.into()))),
                Some(Err(err)) => return this.finish(Some(Err(err))),
                None => return this.finish(Some(Err(Error::TransactionClosed))),
            }
        }
    }
}

impl FusedStream for ResponseParts {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl Drop for ResponseParts {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let id = self.slot.id();
        let mut abandoned = self.shared.abandoned.lock();
        if !self.shared.parts.remove(id) {
            return;
        }

        let mut finished = false;
        while let Some(value) = self.slot.try_recv() {
            match value {
                Ok(ResPart::Data(_)) => {}
                Ok(ResPart::Continue) => {
                    // Fails only once the stream is closing
                    let _ = self.shared.dispatcher.dispatch_now(continue_req(id));
                }
                _ => finished = true,
            }
        }
        if !finished {
            abandoned.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientMessage, Request, ServerError};
    use futures::channel::mpsc;
    use futures::SinkExt;

    /// Test peer standing in for the server side of a transaction stream
    struct Peer {
        requests: mpsc::UnboundedReceiver<ClientMessage>,
        responses: mpsc::UnboundedSender<Result<ServerMessage>>,
    }

    impl Peer {
        async fn next_req(&mut self) -> TransactionReq {
            let mut frame = self.requests.next().await.expect("client stream ended");
            assert_eq!(frame.reqs.len(), 1, "expected one request per frame");
            frame.reqs.remove(0)
        }

        /// Collect `n` requests, however they were batched into frames
        async fn next_reqs(&mut self, n: usize) -> Vec<TransactionReq> {
            let mut reqs = Vec::new();
            while reqs.len() < n {
                let frame = self.requests.next().await.expect("client stream ended");
                reqs.extend(frame.reqs);
            }
            reqs
        }

        fn send(&self, message: ServerMessage) {
            self.responses.unbounded_send(Ok(message)).unwrap();
        }
    }

    fn stream_pair() -> (BidirectionalStream, Peer) {
        let (req_tx, req_rx) = mpsc::unbounded();
        let (res_tx, res_rx) = mpsc::unbounded();
        let channel = TransactionChannel::new(
            req_tx.sink_map_err(|e| Error::unreachable("peer", e)),
            res_rx,
        );
        let stream = BidirectionalStream::new("peer", channel, Duration::from_millis(1));
        let peer = Peer {
            requests: req_rx,
            responses: res_tx,
        };
        (stream, peer)
    }

    fn payload(kind: &str) -> TransactionReqBody {
        TransactionReqBody::Payload(Request::new(kind, Vec::new()))
    }

    #[tokio::test]
    async fn test_single_round_trip() {
        let (stream, mut peer) = stream_pair();

        let fut = stream.single(payload("define"), false).unwrap();
        let req = peer.next_req().await;
        assert_eq!(req.req_id, fut.request_id());
        peer.send(ServerMessage::Res {
            req_id: req.req_id,
            res: Ok(Response::new("define", vec![7])),
        });

        assert_eq!(fut.await.unwrap().payload, vec![7]);
    }

    #[tokio::test]
    async fn test_stream_parts_until_done() {
        let (stream, mut peer) = stream_pair();

        let mut parts = stream.stream(payload("match")).unwrap();
        let req = peer.next_req().await;
        for i in 0..3u8 {
            peer.send(ServerMessage::ResPart {
                req_id: req.req_id,
                part: ResPart::Data(Response::new("answer", vec![i])),
            });
        }
        peer.send(ServerMessage::ResPart {
            req_id: req.req_id,
            part: ResPart::Done,
        });

        let mut seen = Vec::new();
        while let Some(res) = parts.next().await {
            seen.push(res.unwrap().payload[0]);
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(parts.is_terminated());
        assert!(parts.next().await.is_none());
    }

    #[tokio::test]
    async fn test_continue_sends_continuation_with_same_id() {
        let (stream, mut peer) = stream_pair();

        let mut parts = stream.stream(payload("match")).unwrap();
        let req = peer.next_req().await;
        peer.send(ServerMessage::ResPart {
            req_id: req.req_id,
            part: ResPart::Data(Response::new("answer", vec![1])),
        });
        peer.send(ServerMessage::ResPart {
            req_id: req.req_id,
            part: ResPart::Continue,
        });

        assert_eq!(parts.next().await.unwrap().unwrap().payload, vec![1]);

        let consumer = tokio::spawn(async move { parts.next().await });
        let continuation = peer.next_req().await;
        assert_eq!(continuation.req_id, req.req_id);
        assert_eq!(continuation.body, TransactionReqBody::StreamContinue);

        peer.send(ServerMessage::ResPart {
            req_id: req.req_id,
            part: ResPart::Done,
        });
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_domain_error_reaches_only_its_caller() {
        let (stream, mut peer) = stream_pair();

        let failing = stream.single(payload("insert"), false).unwrap();
        let failing_req = peer.next_req().await;
        let ok = stream.single(payload("insert"), false).unwrap();
        let ok_req = peer.next_req().await;

        peer.send(ServerMessage::Res {
            req_id: failing_req.req_id,
            res: Err(ServerError::domain("invalid thing")),
        });
        peer.send(ServerMessage::Res {
            req_id: ok_req.req_id,
            res: Ok(Response::new("insert", Vec::new())),
        });

        assert_eq!(failing.await.unwrap_err(), Error::Domain("invalid thing".into()));
        assert!(ok.await.is_ok());
        assert!(stream.is_open());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (stream, mut peer) = stream_pair();

        let singles: Vec<_> = (0..20u8)
            .map(|i| {
                let body = TransactionReqBody::Payload(Request::new("get", vec![i]));
                stream.single(body, true).unwrap()
            })
            .collect();
        let parts = stream.stream(payload("match")).unwrap();
        let stream_id = parts.request_id();
        let reqs = peer.next_reqs(21).await;

        // Answer newest first, with stream parts in between
        for (n, req) in reqs.iter().rev().enumerate() {
            if req.req_id == stream_id {
                continue;
            }
            let TransactionReqBody::Payload(request) = &req.body else {
                panic!("unexpected request body: {:?}", req.body);
            };
            peer.send(ServerMessage::Res {
                req_id: req.req_id,
                res: Ok(Response::new("get", request.payload.clone())),
            });
            if n % 5 == 0 {
                peer.send(ServerMessage::ResPart {
                    req_id: stream_id,
                    part: ResPart::Data(Response::new("answer", vec![n as u8])),
                });
            }
        }
        peer.send(ServerMessage::ResPart {
            req_id: stream_id,
            part: ResPart::Done,
        });

        let responses = futures::future::join_all(singles).await;
        for (i, res) in responses.into_iter().enumerate() {
            assert_eq!(res.unwrap().payload, vec![i as u8]);
        }
        let seen: Vec<u8> = parts.map(|p| p.unwrap().payload[0]).collect().await;
        assert_eq!(seen, vec![5, 10, 15, 20]);
        assert!(stream.is_open());
    }

    #[tokio::test]
    async fn test_dropped_parts_are_drained_to_done() {
        let (stream, mut peer) = stream_pair();

        let mut parts = stream.stream(payload("match")).unwrap();
        let req = peer.next_req().await;
        peer.send(ServerMessage::ResPart {
            req_id: req.req_id,
            part: ResPart::Data(Response::new("answer", vec![1])),
        });
        assert_eq!(parts.next().await.unwrap().unwrap().payload, vec![1]);

        drop(parts);
        assert!(!stream.shared.parts.contains(req.req_id));

        peer.send(ServerMessage::ResPart {
            req_id: req.req_id,
            part: ResPart::Data(Response::new("answer", vec![2])),
        });
        peer.send(ServerMessage::ResPart {
            req_id: req.req_id,
            part: ResPart::Continue,
        });
        let continuation = peer.next_req().await;
        assert_eq!(continuation.req_id, req.req_id);
        assert_eq!(continuation.body, TransactionReqBody::StreamContinue);
        peer.send(ServerMessage::ResPart {
            req_id: req.req_id,
            part: ResPart::Done,
        });

        let fut = stream.single(payload("define"), false).unwrap();
        let next = peer.next_req().await;
        peer.send(ServerMessage::Res {
            req_id: next.req_id,
            res: Ok(Response::new("define", Vec::new())),
        });
        assert!(fut.await.is_ok());
        assert!(stream.is_open());
        assert!(stream.shared.abandoned.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_request_id_closes_stream() {
        let (stream, mut peer) = stream_pair();

        let pending = stream.single(payload("match"), false).unwrap();
        let _ = peer.next_req().await;
        let stray = RequestId::new();
        peer.send(ServerMessage::Res {
            req_id: stray,
            res: Ok(Response::new("match", Vec::new())),
        });

        assert_eq!(pending.await.unwrap_err(), Error::UnknownRequestId(stray));
        assert!(!stream.is_open());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_later_calls() {
        let (stream, mut peer) = stream_pair();

        let pending = stream.single(payload("match"), false).unwrap();
        let mut parts = stream.stream(payload("match")).unwrap();
        let _ = peer.next_req().await;

        stream.close(None);
        stream.close(None);

        assert_eq!(pending.await.unwrap_err(), Error::TransactionClosed);
        assert_eq!(parts.next().await.unwrap().unwrap_err(), Error::TransactionClosed);
        assert!(parts.next().await.is_none());

        assert_eq!(
            stream.single(payload("match"), true).err(),
            Some(Error::TransactionClosed)
        );
        assert!(matches!(stream.stream(payload("match")), Err(Error::TransactionClosed)));
    }

    #[tokio::test]
    async fn test_server_disconnect_is_unreachable() {
        let (stream, mut peer) = stream_pair();

        let pending = stream.single(payload("match"), false).unwrap();
        let _ = peer.next_req().await;
        drop(peer);

        assert!(pending.await.unwrap_err().is_unreachable());
        assert!(!stream.is_open());
    }

    #[tokio::test]
    async fn test_stream_failure_closes_with_server_error() {
        let (stream, mut peer) = stream_pair();

        let pending = stream.single(payload("match"), false).unwrap();
        let _ = peer.next_req().await;
        peer.send(ServerMessage::Failure(ServerError::domain("transaction timed out")));

        assert_eq!(
            pending.await.unwrap_err(),
            Error::Domain("transaction timed out".into())
        );
        assert!(!stream.is_open());
    }
}
