//! Peer identities and their mutable liveness state.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Sentinel stored in [`PeerRecord`] for "never contacted".
const NEVER: Timestamp = 0;

/// Wall-clock time in milliseconds, never equal to the "never" sentinel.
pub fn now_millis() -> Timestamp {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    millis.max(NEVER + 1)
}

/// A network-addressable peer: its key plus the address it is reachable at.
///
/// Equality and hashing look at the key only, so two identities with the same
/// key but different addresses name the same peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub key: Key,
    pub addr: SocketAddr,
}

impl PeerIdentity {
    pub fn new(key: Key, addr: SocketAddr) -> Self {
        Self { key, addr }
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.addr)
    }
}

/// How we came to know about a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The peer itself sent us a message at the given time.
    Contacted(Timestamp),
    /// The peer was only mentioned by someone else (e.g. in a `Nodes` reply).
    Indirect,
}

impl Observation {
    /// Direct contact observed right now.
    pub fn now() -> Self {
        Observation::Contacted(now_millis())
    }
}

/// Liveness bookkeeping for one peer held in a bucket.
///
/// The mutable fields are atomics so that probe tasks can flip the probe lock
/// and contact time without holding the owning bucket's lock.
#[derive(Debug)]
pub struct PeerRecord {
    identity: PeerIdentity,
    last_contact: AtomicU64,
    probe_in_flight: AtomicBool,
    dead: AtomicBool,
}

impl PeerRecord {
    pub fn contacted(identity: PeerIdentity, at: Timestamp) -> Self {
        Self::with_contact(identity, at.max(NEVER + 1))
    }

    pub fn indirect(identity: PeerIdentity) -> Self {
        Self::with_contact(identity, NEVER)
    }

    pub fn from_observation(identity: PeerIdentity, observation: Observation) -> Self {
        match observation {
            Observation::Contacted(at) => Self::contacted(identity, at),
            Observation::Indirect => Self::indirect(identity),
        }
    }

    fn with_contact(identity: PeerIdentity, last_contact: Timestamp) -> Self {
        Self {
            identity,
            last_contact: AtomicU64::new(last_contact),
            probe_in_flight: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn key(&self) -> &Key {
        &self.identity.key
    }

    /// Time of the most recent confirmed contact, if any.
    pub fn last_contact(&self) -> Option<Timestamp> {
        match self.last_contact.load(Ordering::Acquire) {
            NEVER => None,
            at => Some(at),
        }
    }

    pub fn has_never_contacted(&self) -> bool {
        self.last_contact().is_none()
    }

    /// Record a confirmed contact. The dead marker is left alone; only a newer
    /// observation absorbed by the bucket clears it.
    pub fn mark_contacted(&self, at: Timestamp) {
        self.last_contact
            .fetch_max(at.max(NEVER + 1), Ordering::AcqRel);
    }

    /// Whether the last confirmed contact lies within `window` of `now`.
    pub fn contacted_within(&self, window: Duration, now: Timestamp) -> bool {
        match self.last_contact() {
            Some(at) => now.saturating_sub(at) <= window.as_millis() as u64,
            None => false,
        }
    }

    /// Try to become the single outstanding probe for this peer.
    pub fn try_lock_for_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_probe_lock(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    pub fn is_probe_in_flight(&self) -> bool {
        self.probe_in_flight.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Adopt the state of a newer observation of the same peer.
    pub(crate) fn absorb(&self, newer: &PeerRecord) {
        if let Some(at) = newer.last_contact() {
            self.last_contact.store(at, Ordering::Release);
        }
        self.dead.store(newer.is_dead(), Ordering::Release);
    }
}
