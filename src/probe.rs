//! Liveness probes used by bucket stabilization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::correlation::{CorrelationLayer, Expectation};
use crate::error::KadError;
use crate::key::KeyFactory;
use crate::peer::PeerIdentity;
use crate::protocol::{KadMessage, MessageBody, MessageKind};

/// Checks whether a peer is still answering.
///
/// The routing table only depends on this trait, so tests can decide probe
/// outcomes without a network.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn ping(&self, peer: &PeerIdentity) -> Result<(), KadError>;
}

/// Probes with a `Ping` and waits for the matching `Pong`.
#[derive(Debug)]
pub struct PingProber {
    correlation: Arc<CorrelationLayer>,
    local: PeerIdentity,
    key_factory: Arc<KeyFactory>,
    timeout: Duration,
}

impl PingProber {
    pub fn new(
        correlation: Arc<CorrelationLayer>,
        local: PeerIdentity,
        key_factory: Arc<KeyFactory>,
        timeout: Duration,
    ) -> Self {
        Self {
            correlation,
            local,
            key_factory,
            timeout,
        }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn ping(&self, peer: &PeerIdentity) -> Result<(), KadError> {
        let request = KadMessage::new(
            self.key_factory.message_id(),
            self.local.clone(),
            MessageBody::Ping,
        );
        let expect = Expectation::reply_to(&request, self.timeout)
            .of_kind(MessageKind::Pong)
            .from_sender(peer.key.clone());
        self.correlation
            .send_request(peer.addr, &request, expect)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use parking_lot::Mutex;

    use super::*;
    use crate::key::Key;
    use crate::net::Transport;

    /// Answers every ping with a pong from `responder`, fed straight back
    /// into the correlation layer.
    struct Echo {
        layer: Mutex<Option<Arc<CorrelationLayer>>>,
        responder: PeerIdentity,
    }

    impl Transport for Echo {
        fn send(&self, _to: SocketAddr, msg: &KadMessage) -> Result<(), KadError> {
            let layer = self.layer.lock().clone();
            if let Some(layer) = layer {
                let reply = msg.reply(self.responder.clone(), MessageBody::Pong);
                tokio::spawn(async move {
                    let _ = layer.on_inbound_message(reply);
                });
            }
            Ok(())
        }
    }

    fn peer(byte: u8) -> PeerIdentity {
        PeerIdentity::new(
            Key::from_bytes(vec![byte; 4]),
            SocketAddr::from(([127, 0, 0, 1], 8000 + byte as u16)),
        )
    }

    fn prober(responder: PeerIdentity) -> PingProber {
        let transport = Arc::new(Echo {
            layer: Mutex::new(None),
            responder,
        });
        let layer = Arc::new(CorrelationLayer::new(transport.clone()));
        *transport.layer.lock() = Some(layer.clone());
        PingProber::new(
            layer,
            peer(1),
            Arc::new(KeyFactory::new(4, Some(1))),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn pong_from_probed_peer_succeeds() {
        let prober = prober(peer(2));
        prober.ping(&peer(2)).await.expect("pong");
    }

    #[tokio::test(start_paused = true)]
    async fn pong_from_someone_else_times_out() {
        let prober = prober(peer(3));
        let err = prober.ping(&peer(2)).await.expect_err("wrong sender");
        assert!(err.is_timeout());
    }
}
