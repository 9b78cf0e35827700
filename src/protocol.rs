//! Wire messages exchanged between peers.
//!
//! Every datagram carries exactly one [`KadMessage`]. Replies reuse the
//! [`MessageId`] of the request they answer, which is what the correlation
//! layer matches on.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::Key;
use crate::peer::PeerIdentity;

/// Correlation identifier carried by every message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A single datagram's worth of protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KadMessage {
    pub id: MessageId,
    /// The sender. Its address is overwritten with the observed datagram
    /// source on receipt.
    pub src: PeerIdentity,
    pub body: MessageBody,
}

impl KadMessage {
    pub fn new(id: MessageId, src: PeerIdentity, body: MessageBody) -> Self {
        Self { id, src, body }
    }

    /// Build a reply to this message, reusing its identifier.
    pub fn reply(&self, src: PeerIdentity, body: MessageBody) -> Self {
        Self {
            id: self.id,
            src,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Message payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Liveness probe.
    Ping,
    /// Answer to [`MessageBody::Ping`].
    Pong,
    /// Ask for the peers closest to `key`.
    FindNode { key: Key },
    /// Answer to [`MessageBody::FindNode`].
    Nodes { nodes: Vec<PeerIdentity> },
    /// Application message, no reply expected.
    Content { tag: String, payload: Vec<u8> },
    /// Application request.
    ContentRequest { tag: String, payload: Vec<u8> },
    /// Answer to [`MessageBody::ContentRequest`].
    ContentResponse { payload: Vec<u8> },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Ping => MessageKind::Ping,
            MessageBody::Pong => MessageKind::Pong,
            MessageBody::FindNode { .. } => MessageKind::FindNode,
            MessageBody::Nodes { .. } => MessageKind::Nodes,
            MessageBody::Content { .. } => MessageKind::Content,
            MessageBody::ContentRequest { .. } => MessageKind::ContentRequest,
            MessageBody::ContentResponse { .. } => MessageKind::ContentResponse,
        }
    }
}

/// Payload-free discriminant of [`MessageBody`], used for filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    FindNode,
    Nodes,
    Content,
    ContentRequest,
    ContentResponse,
}

impl MessageKind {
    /// Whether messages of this kind answer a request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::Pong | MessageKind::Nodes | MessageKind::ContentResponse
        )
    }
}
