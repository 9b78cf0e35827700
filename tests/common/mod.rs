#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use kadnet::net::{decode, encode};
use kadnet::{KadConfig, KadError, KadMessage, KadNet, MessageKind, Transport};

/// In-memory datagram network shared by every [`TestNode`].
///
/// Datagrams are encoded and decoded on the way through, then delivered on a
/// fresh task, so delivery is asynchronous like real UDP.
#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<SocketAddr, KadNet>>,
    /// Sends to these addresses are rejected synchronously.
    failures: Mutex<HashSet<SocketAddr>>,
    /// Datagrams to these addresses vanish in flight.
    silenced: Mutex<HashSet<SocketAddr>>,
    sent: Mutex<Vec<(SocketAddr, SocketAddr, MessageKind)>>,
}

impl NetworkRegistry {
    pub fn register(&self, node: &KadNet) {
        self.peers.write().insert(node.local_node().addr, node.clone());
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<KadNet> {
        self.peers.read().get(addr).cloned()
    }

    pub fn set_failure(&self, addr: SocketAddr, fail: bool) {
        let mut failures = self.failures.lock();
        if fail {
            failures.insert(addr);
        } else {
            failures.remove(&addr);
        }
    }

    pub fn set_silenced(&self, addr: SocketAddr, silent: bool) {
        let mut silenced = self.silenced.lock();
        if silent {
            silenced.insert(addr);
        } else {
            silenced.remove(&addr);
        }
    }

    /// `(from, to)` of every datagram of `kind` handed to the network.
    pub fn sent(&self, kind: MessageKind) -> Vec<(SocketAddr, SocketAddr)> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, _, k)| *k == kind)
            .map(|(from, to, _)| (*from, *to))
            .collect()
    }
}

#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    addr: SocketAddr,
}

impl Transport for TestNetwork {
    fn send(&self, to: SocketAddr, msg: &KadMessage) -> Result<(), KadError> {
        self.registry.sent.lock().push((self.addr, to, msg.kind()));
        if self.registry.failures.lock().contains(&to) {
            return Err(KadError::SendQueueFull);
        }
        let datagram = encode(msg)?;
        if self.registry.silenced.lock().contains(&to) {
            return Ok(());
        }
        if let Some(peer) = self.registry.get(&to) {
            let msg = decode(&datagram)?;
            let from = self.addr;
            tokio::spawn(async move { peer.handle_inbound(msg, from).await });
        }
        Ok(())
    }
}

pub struct TestNode {
    pub node: KadNet,
}

impl TestNode {
    pub fn new(registry: &Arc<NetworkRegistry>, index: u32, config: KadConfig) -> Self {
        let addr = make_addr(index);
        let transport = TestNetwork {
            registry: Arc::clone(registry),
            addr,
        };
        let config = KadConfig {
            seed: Some(u64::from(index)),
            ..config
        };
        let node = KadNet::with_transport(config, addr, Arc::new(transport))
            .expect("valid test configuration");
        registry.register(&node);
        Self { node }
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.local_node().addr
    }
}

pub fn make_addr(index: u32) -> SocketAddr {
    let [_, a, b, c] = index.to_be_bytes();
    SocketAddr::from(([10, a, b, c], 4000))
}

/// Small keys keep bucket refreshes cheap.
pub fn test_config(bucket_size: usize) -> KadConfig {
    KadConfig {
        key_size: 4,
        bucket_size,
        ..KadConfig::default()
    }
}
