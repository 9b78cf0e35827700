//! The [`KadNet`] facade: a running overlay node.
//!
//! `KadNet` wires the key factory, routing table, correlation layer and lookup
//! together, serves inbound requests and exposes the application API:
//!
//! * [`create`](KadNet::create) - bind a UDP socket and start receiving
//! * [`join`](KadNet::join) - bootstrap from known addresses and refresh buckets
//! * [`find_node`](KadNet::find_node) - iterative lookup
//! * [`register`](KadNet::register) - install an application [`MessageHandler`]
//! * [`send_message`](KadNet::send_message) / [`send_request`](KadNet::send_request)
//!
//! The handle is cheap to clone and can be shared between tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bucket::InsertOutcome;
use crate::config::KadConfig;
use crate::correlation::{CorrelationLayer, Expectation, Inbound};
use crate::error::KadError;
use crate::key::{Key, KeyFactory};
use crate::lookup::Lookup;
use crate::net::{decode, Transport, UdpTransport, MAX_DATAGRAM};
use crate::peer::{Observation, PeerIdentity};
use crate::probe::PingProber;
use crate::protocol::{KadMessage, MessageBody, MessageKind};
use crate::routing::RoutingTable;

const RECV_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Application callbacks for tagged content.
///
/// Both methods default to doing nothing, so a handler only implements the
/// side it cares about.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// A fire-and-forget message arrived.
    async fn on_incoming_message(&self, _from: &PeerIdentity, _tag: &str, _payload: Vec<u8>) {}

    /// A request arrived; `Some` is sent back as the response.
    async fn on_incoming_request(
        &self,
        _from: &PeerIdentity,
        _tag: &str,
        _payload: Vec<u8>,
    ) -> Option<Vec<u8>> {
        None
    }
}

/// Snapshot of node state for telemetry and debugging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Peers across all buckets.
    pub known_peers: usize,
    /// Buckets holding at least one peer.
    pub buckets_in_use: usize,
    /// Requests waiting for a reply.
    pub outstanding_requests: usize,
}

/// A node participating in the overlay.
#[derive(Clone)]
pub struct KadNet {
    inner: Arc<KadInner>,
}

struct KadInner {
    config: KadConfig,
    local: PeerIdentity,
    key_factory: Arc<KeyFactory>,
    routing: Arc<RoutingTable>,
    correlation: Arc<CorrelationLayer>,
    lookup: Lookup,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for KadInner {
    fn drop(&mut self) {
        if let Some(task) = self.receiver.lock().take() {
            task.abort();
        }
    }
}

impl KadNet {
    /// Bind a UDP socket on `config.bind` and start serving it.
    pub async fn create(config: KadConfig) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind).await?;
        let addr = transport.local_addr()?;
        let socket = transport.socket();
        let node = Self::with_transport(config, addr, Arc::new(transport))?;

        let task = node.spawn_receiver(socket);
        *node.inner.receiver.lock() = Some(task);

        info!(key = %node.inner.local.key, %addr, "node created");
        Ok(node)
    }

    /// Build a node on a caller-supplied transport.
    ///
    /// Nothing is received automatically: the owner of the transport feeds
    /// inbound messages through [`KadNet::handle_inbound`].
    pub fn with_transport(
        config: KadConfig,
        addr: SocketAddr,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, KadError> {
        config.validate()?;
        let key_factory = Arc::new(KeyFactory::new(config.key_size, config.seed));
        let local = PeerIdentity::new(key_factory.generate(), addr);
        let correlation = Arc::new(CorrelationLayer::new(transport));
        let prober = Arc::new(PingProber::new(
            Arc::clone(&correlation),
            local.clone(),
            Arc::clone(&key_factory),
            config.request_timeout(),
        ));
        let routing = Arc::new(RoutingTable::new(local.key.clone(), &config, prober));
        let lookup = Lookup::new(
            local.clone(),
            Arc::clone(&routing),
            Arc::clone(&correlation),
            Arc::clone(&key_factory),
            config.bucket_size,
            config.concurrency,
            config.request_timeout(),
        );

        Ok(Self {
            inner: Arc::new(KadInner {
                config,
                local,
                key_factory,
                routing,
                correlation,
                lookup,
                handlers: RwLock::new(HashMap::new()),
                receiver: Mutex::new(None),
            }),
        })
    }

    pub fn local_node(&self) -> &PeerIdentity {
        &self.inner.local
    }

    pub fn config(&self) -> &KadConfig {
        &self.inner.config
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.inner.routing
    }

    pub fn key_factory(&self) -> &Arc<KeyFactory> {
        &self.inner.key_factory
    }

    pub fn correlation(&self) -> &Arc<CorrelationLayer> {
        &self.inner.correlation
    }

    /// Enter the overlay through `bootstrap`.
    ///
    /// Asks every bootstrap address for our own key, looks ourselves up, then
    /// refreshes each bucket farther away than our closest neighbour. Fails if
    /// no bootstrap address answered.
    pub async fn join(&self, bootstrap: &[SocketAddr]) -> Result<()> {
        let local_key = self.inner.local.key.clone();
        let replies = join_all(
            bootstrap
                .iter()
                .map(|addr| self.inner.lookup.query(*addr, &local_key, None)),
        )
        .await;

        let mut answered = 0usize;
        for (addr, reply) in bootstrap.iter().zip(replies) {
            match reply {
                Ok(nodes) => {
                    answered += 1;
                    let offered = nodes.len();
                    let stored = nodes
                        .into_iter()
                        .map(|node| self.inner.routing.insert(node, Observation::Indirect))
                        .filter(InsertOutcome::is_stored)
                        .count();
                    debug!(%addr, offered, stored, "bootstrap peer answered");
                }
                Err(err) => warn!(%addr, "bootstrap peer did not answer: {err}"),
            }
        }
        if answered == 0 {
            bail!("none of {} bootstrap peers answered", bootstrap.len());
        }

        self.find_node(&local_key).await;

        let refresh: Vec<Key> = match self.inner.routing.closest_bucket_in_use() {
            Some(closest) => (0..closest)
                .map(|index| self.inner.key_factory.random_key_in_bucket(&local_key, index))
                .collect(),
            None => Vec::new(),
        };
        stream::iter(refresh)
            .for_each_concurrent(self.inner.config.concurrency, |key| async move {
                self.find_node(&key).await;
            })
            .await;

        info!(
            peers = self.inner.routing.len(),
            buckets = self.inner.routing.buckets_in_use(),
            "joined overlay"
        );
        Ok(())
    }

    /// The k closest peers to `key`, possibly including this node.
    pub async fn find_node(&self, key: &Key) -> Vec<PeerIdentity> {
        self.inner.lookup.find_node(key).await
    }

    /// Install `handler` for messages and requests tagged `tag`, replacing any
    /// previous one.
    pub fn register(&self, tag: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.write().insert(tag.into(), handler);
    }

    /// Send a fire-and-forget message.
    pub fn send_message(&self, to: &PeerIdentity, tag: &str, payload: Vec<u8>) -> Result<(), KadError> {
        let msg = self.outbound(MessageBody::Content {
            tag: tag.to_owned(),
            payload,
        });
        if let Err(err) = self.inner.correlation.send(to.addr, &msg) {
            debug!(peer = %to.key, "send_message failed: {err}");
            self.inner.routing.mark_dead(to);
            return Err(err);
        }
        Ok(())
    }

    /// Send a request and wait for the peer's response payload.
    pub async fn send_request(
        &self,
        to: &PeerIdentity,
        tag: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, KadError> {
        let msg = self.outbound(MessageBody::ContentRequest {
            tag: tag.to_owned(),
            payload,
        });
        let expect = Expectation::reply_to(&msg, self.inner.config.request_timeout())
            .of_kind(MessageKind::ContentResponse)
            .from_sender(to.key.clone());

        match self.inner.correlation.send_request(to.addr, &msg, expect).await {
            Ok(reply) => match reply.body {
                MessageBody::ContentResponse { payload } => Ok(payload),
                _ => Ok(Vec::new()),
            },
            Err(err) => {
                if !matches!(err, KadError::Timeout | KadError::Cancelled) {
                    self.inner.routing.mark_dead(to);
                }
                Err(err)
            }
        }
    }

    /// Process one inbound message that arrived from `from`.
    ///
    /// Replies are matched to outstanding requests; the sender is recorded as
    /// directly contacted; unsolicited requests are answered.
    pub async fn handle_inbound(&self, mut msg: KadMessage, from: SocketAddr) {
        msg.src.addr = from;
        if !self.inner.key_factory.accepts(&msg.src.key) {
            trace!(%from, "dropping message with malformed sender key");
            return;
        }
        if msg.src.key == self.inner.local.key {
            return;
        }

        let sender = msg.src.clone();
        let inbound = self.inner.correlation.on_inbound_message(msg);
        self.inner.routing.insert(sender, Observation::now());

        match inbound {
            Inbound::Claimed => {}
            Inbound::Unsolicited(msg) if msg.kind().is_response() => {
                trace!(id = ?msg.id, kind = ?msg.kind(), peer = %msg.src.key, "dropping unsolicited response");
            }
            Inbound::Unsolicited(msg) => self.serve(msg).await,
        }
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            known_peers: self.inner.routing.len(),
            buckets_in_use: self.inner.routing.buckets_in_use(),
            outstanding_requests: self.inner.correlation.outstanding(),
        }
    }

    /// Stop receiving. Outstanding requests still resolve by timeout.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.receiver.lock().take() {
            task.abort();
            info!(key = %self.inner.local.key, "node shut down");
        }
    }

    async fn serve(&self, msg: KadMessage) {
        let from = msg.src.clone();
        let body = match &msg.body {
            MessageBody::Ping => Some(MessageBody::Pong),
            MessageBody::FindNode { key } => Some(MessageBody::Nodes {
                nodes: self
                    .inner
                    .routing
                    .closest_known(key, self.inner.config.bucket_size),
            }),
            MessageBody::ContentRequest { tag, payload } => match self.handler(tag) {
                Some(handler) => handler
                    .on_incoming_request(&from, tag, payload.clone())
                    .await
                    .map(|payload| MessageBody::ContentResponse { payload }),
                None => {
                    debug!(%tag, peer = %from.key, "no handler for request");
                    None
                }
            },
            MessageBody::Content { tag, payload } => {
                match self.handler(tag) {
                    Some(handler) => handler.on_incoming_message(&from, tag, payload.clone()).await,
                    None => debug!(%tag, peer = %from.key, "no handler for message"),
                }
                None
            }
            MessageBody::Pong | MessageBody::Nodes { .. } | MessageBody::ContentResponse { .. } => None,
        };

        if let Some(body) = body {
            let reply = msg.reply(self.inner.local.clone(), body);
            if let Err(err) = self.inner.correlation.send(from.addr, &reply) {
                debug!(peer = %from.key, "reply failed: {err}");
                self.inner.routing.mark_dead(&from);
            }
        }
    }

    fn handler(&self, tag: &str) -> Option<Arc<dyn MessageHandler>> {
        self.inner.handlers.read().get(tag).cloned()
    }

    fn outbound(&self, body: MessageBody) -> KadMessage {
        KadMessage::new(
            self.inner.key_factory.message_id(),
            self.inner.local.clone(),
            body,
        )
    }

    fn spawn_receiver(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let mut failures = 0u32;
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => {
                        failures = 0;
                        received
                    }
                    Err(err) => {
                        let delay = recv_backoff(failures);
                        failures = failures.saturating_add(1);
                        warn!(failures, ?delay, "udp receive failed: {err}");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                };
                let msg = match decode(&buf[..len]) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(%from, "dropping undecodable datagram: {err}");
                        continue;
                    }
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let node = KadNet { inner };
                tokio::spawn(async move { node.handle_inbound(msg, from).await });
            }
        })
    }
}

/// Delay before retrying a failed receive: doubles from 10ms up to one second.
fn recv_backoff(failures: u32) -> Duration {
    RECV_BACKOFF_MIN
        .saturating_mul(1u32 << failures.min(7))
        .min(RECV_BACKOFF_MAX)
}

impl std::fmt::Debug for KadNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KadNet")
            .field("local", &self.inner.local)
            .field("routing", &self.inner.routing)
            .finish()
    }
}
