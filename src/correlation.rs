//! Request/response correlation over an unreliable datagram transport.
//!
//! Outbound requests register a pending entry keyed by the request's
//! [`MessageId`]. Inbound messages are offered to
//! [`CorrelationLayer::on_inbound_message`], which hands each one to at most
//! one pending entry whose filters all match; anything unclaimed is returned
//! to the caller as unsolicited.
//!
//! Every pending entry is retired exactly once, by whichever of match,
//! timeout or explicit cancel removes it from the map first. Removal happens
//! under the map's lock and delivery happens after the lock is released, so
//! the losers of that race see an empty slot and do nothing.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::KadError;
use crate::key::Key;
use crate::net::Transport;
use crate::protocol::{KadMessage, MessageId, MessageKind};

/// A single predicate over an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageFilter {
    Id(MessageId),
    Kind(MessageKind),
    Sender(Key),
}

impl MessageFilter {
    pub fn matches(&self, msg: &KadMessage) -> bool {
        match self {
            MessageFilter::Id(id) => msg.id == *id,
            MessageFilter::Kind(kind) => msg.kind() == *kind,
            MessageFilter::Sender(key) => msg.src.key == *key,
        }
    }
}

/// What a pending request is waiting for: a conjunction of filters and a
/// deadline. The correlation id filter is always present.
#[derive(Clone, Debug)]
pub struct Expectation {
    id: MessageId,
    filters: Vec<MessageFilter>,
    timeout: Duration,
}

impl Expectation {
    /// Expect a message carrying the same id as `request`.
    pub fn reply_to(request: &KadMessage, timeout: Duration) -> Self {
        Self {
            id: request.id,
            filters: vec![MessageFilter::Id(request.id)],
            timeout,
        }
    }

    pub fn of_kind(mut self, kind: MessageKind) -> Self {
        self.filters.push(MessageFilter::Kind(kind));
        self
    }

    pub fn from_sender(mut self, key: Key) -> Self {
        self.filters.push(MessageFilter::Sender(key));
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn matches(&self, msg: &KadMessage) -> bool {
        self.filters.iter().all(|filter| filter.matches(msg))
    }
}

/// Result of offering an inbound message to the correlation layer.
#[derive(Debug)]
pub enum Inbound {
    /// A pending request consumed the message.
    Claimed,
    /// No pending request wanted it; the message is handed back.
    Unsolicited(KadMessage),
}

enum Sink {
    Once(oneshot::Sender<Result<KadMessage, KadError>>),
    Many(mpsc::UnboundedSender<KadMessage>),
}

struct Pending {
    slot: u64,
    expectation: Expectation,
    sink: Sink,
    timer: Option<AbortHandle>,
}

impl Pending {
    fn resolve(self, result: Result<KadMessage, KadError>) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        match self.sink {
            Sink::Once(tx) => {
                let _ = tx.send(result);
            }
            Sink::Many(tx) => {
                if let Ok(msg) = result {
                    let _ = tx.send(msg);
                }
            }
        }
    }
}

/// Registry of outstanding requests plus the transport they were sent on.
pub struct CorrelationLayer {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<MessageId, Vec<Pending>>>,
    next_slot: AtomicU64,
}

impl CorrelationLayer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_slot: AtomicU64::new(0),
        }
    }

    /// Fire-and-forget send; nothing is registered.
    pub fn send(&self, to: SocketAddr, msg: &KadMessage) -> Result<(), KadError> {
        trace!(id = ?msg.id, kind = ?msg.kind(), %to, "send");
        self.transport.send(to, msg)
    }

    /// Send `msg` and wait for one message matching `expect`.
    ///
    /// The returned handle resolves exactly once: with the matching message,
    /// with [`KadError::Timeout`], or immediately with the transport's error if
    /// the send was rejected. Must be called from within a tokio runtime.
    pub fn send_request(
        self: &Arc<Self>,
        to: SocketAddr,
        msg: &KadMessage,
        expect: Expectation,
    ) -> ResponseHandle {
        let (tx, rx) = oneshot::channel();
        let (id, timeout) = (expect.id(), expect.timeout());
        let slot = self.register(expect, Sink::Once(tx));
        self.dispatch(to, msg, id, slot, timeout);
        ResponseHandle {
            rx,
            layer: Arc::downgrade(self),
            id,
            slot,
        }
    }

    /// Send `msg` and collect every message matching `expect` until its
    /// timeout elapses.
    pub fn send_request_many(
        self: &Arc<Self>,
        to: SocketAddr,
        msg: &KadMessage,
        expect: Expectation,
    ) -> ReplyStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, timeout) = (expect.id(), expect.timeout());
        let slot = self.register(expect, Sink::Many(tx));
        self.dispatch(to, msg, id, slot, timeout);
        ReplyStream {
            rx,
            layer: Arc::downgrade(self),
            id,
            slot,
        }
    }

    /// Offer an inbound message to the outstanding requests.
    pub fn on_inbound_message(&self, msg: KadMessage) -> Inbound {
        let mut pending = self.pending.lock();
        let Some(entries) = pending.get_mut(&msg.id) else {
            return Inbound::Unsolicited(msg);
        };
        let Some(idx) = entries.iter().position(|p| p.expectation.matches(&msg)) else {
            return Inbound::Unsolicited(msg);
        };

        let stream = match &entries[idx].sink {
            Sink::Many(tx) => Some((entries[idx].slot, tx.clone())),
            Sink::Once(_) => None,
        };
        if let Some((slot, tx)) = stream {
            drop(pending);
            let id = msg.id;
            trace!(id = ?id, slot, "reply delivered to stream");
            if tx.send(msg).is_err() {
                self.retire(id, slot, KadError::Cancelled);
            }
            return Inbound::Claimed;
        }

        let entry = entries.remove(idx);
        if entries.is_empty() {
            pending.remove(&msg.id);
        }
        drop(pending);
        trace!(id = ?msg.id, slot = entry.slot, "reply matched");
        entry.resolve(Ok(msg));
        Inbound::Claimed
    }

    /// Number of requests still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    /// Resolve the entry `(id, slot)` with `cause` if it is still pending.
    ///
    /// Returns `false` when someone else already retired it.
    fn retire(&self, id: MessageId, slot: u64, cause: KadError) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let Some(entries) = pending.get_mut(&id) else {
                return false;
            };
            let Some(idx) = entries.iter().position(|p| p.slot == slot) else {
                return false;
            };
            let entry = entries.remove(idx);
            if entries.is_empty() {
                pending.remove(&id);
            }
            entry
        };
        entry.resolve(Err(cause));
        true
    }

    fn register(&self, expectation: Expectation, sink: Sink) -> u64 {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .entry(expectation.id())
            .or_default()
            .push(Pending {
                slot,
                expectation,
                sink,
                timer: None,
            });
        slot
    }

    fn dispatch(
        self: &Arc<Self>,
        to: SocketAddr,
        msg: &KadMessage,
        id: MessageId,
        slot: u64,
        timeout: Duration,
    ) {
        if let Err(err) = self.send(to, msg) {
            debug!(id = ?id, %to, "request send failed: {err}");
            self.retire(id, slot, err);
            return;
        }

        let layer = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(layer) = layer.upgrade() {
                if layer.retire(id, slot, KadError::Timeout) {
                    debug!(id = ?id, "request timed out");
                }
            }
        });

        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(&id)
            .and_then(|entries| entries.iter_mut().find(|p| p.slot == slot));
        match entry {
            Some(entry) => entry.timer = Some(timer.abort_handle()),
            // Already answered between send and arming.
            None => timer.abort(),
        }
    }
}

impl std::fmt::Debug for CorrelationLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationLayer")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Resolves once with the reply to a request, or its failure.
///
/// Dropping the handle abandons the result; the pending entry is still retired
/// by its timeout.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<KadMessage, KadError>>,
    layer: Weak<CorrelationLayer>,
    id: MessageId,
    slot: u64,
}

impl ResponseHandle {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Retire the pending entry now. No-op if it was already resolved.
    pub fn cancel(self) {
        if let Some(layer) = self.layer.upgrade() {
            layer.retire(self.id, self.slot, KadError::Cancelled);
        }
    }
}

impl Future for ResponseHandle {
    type Output = Result<KadMessage, KadError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(KadError::Cancelled)))
    }
}

/// Every reply to a multi-consume request, ending when the request expires.
#[derive(Debug)]
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<KadMessage>,
    layer: Weak<CorrelationLayer>,
    id: MessageId,
    slot: u64,
}

impl ReplyStream {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub async fn next(&mut self) -> Option<KadMessage> {
        self.rx.recv().await
    }

    pub fn cancel(self) {
        if let Some(layer) = self.layer.upgrade() {
            layer.retire(self.id, self.slot, KadError::Cancelled);
        }
    }
}

impl Stream for ReplyStream {
    type Item = KadMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
