//! # kadnet
//!
//! A Kademlia key-based routing overlay over UDP. Peers are identified by
//! fixed-width keys and self-organize so that any peer can find the peers
//! whose keys are closest (by XOR distance) to any target key.
//!
//! The crate is split into modules that build on each other:
//!
//! - [`key`]: keys, the XOR metric and the [`KeyFactory`].
//! - [`peer`]: [`PeerIdentity`] and the per-peer liveness state in [`PeerRecord`].
//! - [`bucket`]: a single bucket and its probe-before-evict stabilization policy.
//! - [`routing`]: the [`RoutingTable`], one bucket per shared-prefix length.
//! - [`correlation`]: request/response matching over datagrams, with timeouts.
//! - [`probe`]: the ping/pong liveness exchange used by buckets.
//! - [`protocol`]: the serde wire messages exchanged between peers.
//! - [`net`]: the [`Transport`] seam and its UDP implementation.
//! - [`lookup`]: the iterative FIND_NODE traversal.
//! - [`node`]: the [`KadNet`] facade tying everything together.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use kadnet::{KadConfig, KadNet, MessageHandler, PeerIdentity};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     async fn on_incoming_request(
//!         &self,
//!         _from: &PeerIdentity,
//!         _tag: &str,
//!         payload: Vec<u8>,
//!     ) -> Option<Vec<u8>> {
//!         Some(payload)
//!     }
//! }
//!
//! # async fn launch() -> Result<()> {
//! let node = KadNet::create(KadConfig::default()).await?;
//! node.register("echo", Arc::new(Echo));
//! let seed: SocketAddr = "127.0.0.1:4000".parse()?;
//! node.join(&[seed]).await?;
//!
//! let target = node.key_factory().from_content(b"some topic");
//! for peer in node.find_node(&target).await {
//!     if peer != *node.local_node() {
//!         let reply = node.send_request(&peer, "echo", b"hi".to_vec()).await?;
//!         assert_eq!(reply, b"hi");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod config;
pub mod correlation;
pub mod error;
pub mod key;
pub mod lookup;
pub mod net;
pub mod node;
pub mod peer;
pub mod probe;
pub mod protocol;
pub mod routing;

pub use bucket::{Bucket, InsertOutcome, ProbeOutcome, ProbeResolution};
pub use config::KadConfig;
pub use correlation::{
    CorrelationLayer, Expectation, Inbound, MessageFilter, ReplyStream, ResponseHandle,
};
pub use error::KadError;
pub use key::{distance_cmp, Key, KeyFactory};
pub use net::{Transport, UdpTransport};
pub use node::{KadNet, MessageHandler, TelemetrySnapshot};
pub use peer::{Observation, PeerIdentity, PeerRecord};
pub use probe::{PingProber, Prober};
pub use protocol::{KadMessage, MessageBody, MessageId, MessageKind};
pub use routing::RoutingTable;
