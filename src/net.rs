//! Datagram transport.
//!
//! The routing core only needs a synchronous "enqueue this datagram" primitive,
//! captured by the [`Transport`] trait. [`UdpTransport`] implements it over a
//! tokio [`UdpSocket`] with JSON-encoded [`KadMessage`]s; tests swap in an
//! in-memory implementation.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::KadError;
use crate::protocol::KadMessage;

/// Largest datagram we are willing to send or receive (64 KiB).
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Fire-and-forget message delivery.
///
/// `send` reports only whether the datagram was accepted for sending; delivery
/// itself is best effort and unordered.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: SocketAddr, msg: &KadMessage) -> Result<(), KadError>;
}

/// Serialize a message into a datagram payload.
pub fn encode(msg: &KadMessage) -> Result<Vec<u8>, KadError> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > MAX_DATAGRAM {
        return Err(KadError::MessageTooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Parse a datagram payload.
pub fn decode(bytes: &[u8]) -> Result<KadMessage, KadError> {
    if bytes.len() > MAX_DATAGRAM {
        return Err(KadError::MessageTooLarge(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// [`Transport`] over a bound UDP socket.
#[derive(Clone, Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, KadError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, KadError> {
        Ok(self.socket.local_addr()?)
    }

    /// The underlying socket, shared with the receive loop.
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: SocketAddr, msg: &KadMessage) -> Result<(), KadError> {
        let bytes = encode(msg)?;
        match self.socket.try_send_to(&bytes, to) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(KadError::SendQueueFull),
            Err(err) => Err(err.into()),
        }
    }
}
