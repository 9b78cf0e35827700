//! Iterative FIND_NODE traversal.
//!
//! The lookup:
//! 1. Seeds a shortlist with the k closest known peers plus the local node
//! 2. Queries up to α unqueried members of the current k closest in parallel
//! 3. Merges returned peers into the shortlist (and the routing table, as
//!    indirect observations); drops peers that failed to answer and keeps
//!    them out for the rest of the lookup
//! 4. Repeats until each of the k closest has been queried
//! 5. Returns those k closest, ordered by XOR distance to the target

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, trace};

use crate::correlation::{CorrelationLayer, Expectation};
use crate::error::KadError;
use crate::key::{distance_cmp, Key, KeyFactory};
use crate::peer::{Observation, PeerIdentity};
use crate::protocol::{KadMessage, MessageBody, MessageKind};
use crate::routing::RoutingTable;

#[derive(Debug)]
pub struct Lookup {
    local: PeerIdentity,
    routing: Arc<RoutingTable>,
    correlation: Arc<CorrelationLayer>,
    key_factory: Arc<KeyFactory>,
    k: usize,
    alpha: usize,
    timeout: Duration,
}

impl Lookup {
    pub fn new(
        local: PeerIdentity,
        routing: Arc<RoutingTable>,
        correlation: Arc<CorrelationLayer>,
        key_factory: Arc<KeyFactory>,
        k: usize,
        alpha: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            routing,
            correlation,
            key_factory,
            k,
            alpha: alpha.max(1),
            timeout,
        }
    }

    /// Find the k peers closest to `target`, the local node included.
    pub async fn find_node(&self, target: &Key) -> Vec<PeerIdentity> {
        let mut shortlist = self.routing.closest_known(target, self.k);
        if !shortlist.contains(&self.local) {
            shortlist.push(self.local.clone());
        }
        shortlist.sort_by(|a, b| distance_cmp(target, &a.key, &b.key));

        let mut queried: HashSet<Key> = HashSet::new();
        queried.insert(self.local.key.clone());
        // Peers that failed to answer stay out even if others still list them.
        let mut failed: HashSet<Key> = HashSet::new();
        let mut rounds = 0usize;

        loop {
            let batch: Vec<PeerIdentity> = shortlist
                .iter()
                .take(self.k)
                .filter(|peer| !queried.contains(&peer.key))
                .take(self.alpha)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            rounds += 1;

            for peer in &batch {
                queried.insert(peer.key.clone());
            }
            let replies = join_all(
                batch
                    .iter()
                    .map(|peer| self.query(peer.addr, target, Some(&peer.key))),
            )
            .await;

            for (peer, reply) in batch.into_iter().zip(replies) {
                match reply {
                    Ok(nodes) => {
                        trace!(peer = %peer.key, returned = nodes.len(), "find_node reply");
                        for node in nodes {
                            if !self.key_factory.accepts(&node.key) {
                                continue;
                            }
                            self.routing.insert(node.clone(), Observation::Indirect);
                            if !failed.contains(&node.key) && !shortlist.contains(&node) {
                                shortlist.push(node);
                            }
                        }
                    }
                    Err(err) => {
                        debug!(peer = %peer.key, addr = %peer.addr, "find_node failed: {err}");
                        self.routing.mark_dead(&peer);
                        shortlist.retain(|candidate| *candidate != peer);
                        failed.insert(peer.key);
                    }
                }
            }
            shortlist.sort_by(|a, b| distance_cmp(target, &a.key, &b.key));
        }

        shortlist.truncate(self.k);
        debug!(target = %target, rounds, found = shortlist.len(), "lookup finished");
        shortlist
    }

    /// Ask the peer at `addr` for its closest peers to `target`.
    ///
    /// With `sender` set, only a reply from that key is accepted; bootstrap
    /// queries leave it unset because the peer's key is not known yet.
    pub async fn query(
        &self,
        addr: SocketAddr,
        target: &Key,
        sender: Option<&Key>,
    ) -> Result<Vec<PeerIdentity>, KadError> {
        let request = KadMessage::new(
            self.key_factory.message_id(),
            self.local.clone(),
            MessageBody::FindNode {
                key: target.clone(),
            },
        );
        let mut expect = Expectation::reply_to(&request, self.timeout).of_kind(MessageKind::Nodes);
        if let Some(key) = sender {
            expect = expect.from_sender(key.clone());
        }
        let reply = self.correlation.send_request(addr, &request, expect).await?;
        match reply.body {
            MessageBody::Nodes { nodes } => Ok(nodes),
            _ => Ok(Vec::new()),
        }
    }
}
