//! A single routing bucket and its stabilization policy.
//!
//! A bucket holds at most `max_size` peers ordered by recency of confirmed
//! contact: the head is the stalest entry and the first eviction candidate,
//! the tail is the most recently confirmed one.
//!
//! Inserting into a full bucket never blocks on the network. When the head has
//! to be validated before it can be replaced, [`Bucket::insert`] hands back an
//! [`Eviction`] with the head's probe lock already held; the caller probes the
//! head and reports the result through [`Bucket::complete_probe`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::key::Key;
use crate::peer::{PeerIdentity, PeerRecord, Timestamp};

/// Result of offering a peer to a bucket.
#[derive(Debug)]
pub enum InsertOutcome {
    /// The peer was present and the observation was newer: moved to the tail.
    Refreshed,
    /// The peer was present and the observation was not newer.
    Unchanged,
    /// The bucket had room and the peer was appended.
    Appended,
    /// The bucket is full and the candidate was only known indirectly.
    DroppedIndirect,
    /// The head was only known indirectly and was replaced by the candidate.
    ReplacedIndirect { evicted: PeerIdentity },
    /// The head was confirmed recently enough; the candidate was dropped.
    DroppedHealthy,
    /// Another probe of the head is already outstanding; the candidate was dropped.
    ProbeInFlight,
    /// The head must be probed; its probe lock is held by the returned eviction.
    ProbeRequired(Eviction),
    /// The routing table handed the probe of `probed` to a worker; the
    /// candidate's fate is decided when it completes.
    ProbeDispatched { probed: PeerIdentity },
    /// No probe worker was available; the head's lock was released and the
    /// candidate dropped.
    ProbeSkipped,
    /// The peer cannot be placed (local key, wrong key width, zero capacity).
    Ignored,
}

impl InsertOutcome {
    /// Whether the candidate ended up in the bucket.
    pub fn is_stored(&self) -> bool {
        matches!(
            self,
            InsertOutcome::Refreshed
                | InsertOutcome::Unchanged
                | InsertOutcome::Appended
                | InsertOutcome::ReplacedIndirect { .. }
        )
    }
}

/// A pending replacement of a bucket head, decided by a liveness probe.
#[derive(Debug)]
pub struct Eviction {
    probed: Arc<PeerRecord>,
    replacement: Arc<PeerRecord>,
}

impl Eviction {
    /// The head entry whose liveness is in question.
    pub fn probed(&self) -> &PeerIdentity {
        self.probed.identity()
    }

    /// The candidate that takes the head's place if the probe fails.
    pub fn replacement(&self) -> &PeerIdentity {
        self.replacement.identity()
    }

    /// Give up on the probe without touching the bucket.
    ///
    /// Used when the probe could not even be dispatched.
    pub fn abandon(self) {
        self.probed.release_probe_lock();
    }
}

/// Outcome of a liveness probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    Unreachable,
}

/// What [`Bucket::complete_probe`] did with the bucket.
#[derive(Debug, PartialEq, Eq)]
pub enum ProbeResolution {
    /// The probed peer answered and stays (moved to the tail if still present).
    Kept,
    /// The probed peer was removed and the replacement appended.
    Replaced,
    /// The replacement was already present; the probed peer was put back at the head.
    Restored,
    /// The probed peer had already left the bucket; nothing changed.
    Vanished,
}

/// Fixed-capacity, recency-ordered set of peers for one distance class.
#[derive(Debug)]
pub struct Bucket {
    entries: Mutex<VecDeque<Arc<PeerRecord>>>,
    max_size: usize,
    valid_timespan: Duration,
}

impl Bucket {
    pub fn new(max_size: usize, valid_timespan: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_size)),
            max_size,
            valid_timespan,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Offer `candidate` to the bucket at time `now`.
    pub fn insert(&self, candidate: PeerRecord, now: Timestamp) -> InsertOutcome {
        let mut entries = self.entries.lock();

        if let Some(pos) = position(&entries, candidate.key()) {
            let stored = entries[pos].last_contact().unwrap_or(0);
            let incoming = candidate.last_contact().unwrap_or(0);
            if incoming <= stored {
                return InsertOutcome::Unchanged;
            }
            if let Some(existing) = entries.remove(pos) {
                existing.absorb(&candidate);
                entries.push_back(existing);
            }
            return InsertOutcome::Refreshed;
        }

        if entries.len() < self.max_size {
            entries.push_back(Arc::new(candidate));
            self.check_capacity(&entries);
            return InsertOutcome::Appended;
        }

        if candidate.has_never_contacted() {
            return InsertOutcome::DroppedIndirect;
        }

        let head = match entries.front() {
            Some(head) => Arc::clone(head),
            None => return InsertOutcome::Ignored,
        };

        if head.has_never_contacted() {
            entries.pop_front();
            entries.push_back(Arc::new(candidate));
            self.check_capacity(&entries);
            return InsertOutcome::ReplacedIndirect {
                evicted: head.identity().clone(),
            };
        }

        if head.contacted_within(self.valid_timespan, now) {
            return InsertOutcome::DroppedHealthy;
        }

        if !head.try_lock_for_probe() {
            return InsertOutcome::ProbeInFlight;
        }

        InsertOutcome::ProbeRequired(Eviction {
            probed: head,
            replacement: Arc::new(candidate),
        })
    }

    /// Apply the result of probing the head named by `eviction`.
    ///
    /// Safe to run concurrently with [`Bucket::insert`] and
    /// [`Bucket::mark_dead`]: the bucket is re-inspected under its lock and
    /// entries are located by key.
    pub fn complete_probe(
        &self,
        eviction: Eviction,
        outcome: ProbeOutcome,
        now: Timestamp,
    ) -> ProbeResolution {
        let Eviction {
            probed,
            replacement,
        } = eviction;

        match outcome {
            ProbeOutcome::Alive => {
                probed.mark_contacted(now);
                probed.release_probe_lock();
                let mut entries = self.entries.lock();
                if let Some(pos) = position(&entries, probed.key()) {
                    if let Some(entry) = entries.remove(pos) {
                        entries.push_back(entry);
                    }
                }
                ProbeResolution::Kept
            }
            ProbeOutcome::Unreachable => {
                probed.release_probe_lock();
                let mut entries = self.entries.lock();
                let Some(pos) = position(&entries, probed.key()) else {
                    return ProbeResolution::Vanished;
                };
                let Some(removed) = entries.remove(pos) else {
                    return ProbeResolution::Vanished;
                };

                let resolution = if entries.len() < self.max_size
                    && position(&entries, replacement.key()).is_none()
                {
                    entries.push_back(replacement);
                    ProbeResolution::Replaced
                } else {
                    entries.push_front(removed);
                    ProbeResolution::Restored
                };
                self.check_capacity(&entries);
                resolution
            }
        }
    }

    /// Flag the peer as dead and move it to the head. Returns whether it was found.
    pub fn mark_dead(&self, key: &Key) -> bool {
        let mut entries = self.entries.lock();
        let Some(pos) = position(&entries, key) else {
            return false;
        };
        if let Some(entry) = entries.remove(pos) {
            entry.mark_dead();
            entries.push_front(entry);
        }
        true
    }

    /// Identities from head (stalest) to tail (freshest).
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.entries
            .lock()
            .iter()
            .map(|record| record.identity().clone())
            .collect()
    }

    /// Shared handle on the record for `key`, if present.
    pub fn record(&self, key: &Key) -> Option<Arc<PeerRecord>> {
        let entries = self.entries.lock();
        position(&entries, key).map(|pos| Arc::clone(&entries[pos]))
    }

    pub fn contains(&self, key: &Key) -> bool {
        position(&self.entries.lock(), key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check_capacity(&self, entries: &VecDeque<Arc<PeerRecord>>) {
        assert!(
            entries.len() <= self.max_size,
            "bucket holds {} entries, capacity is {}",
            entries.len(),
            self.max_size
        );
    }
}

fn position(entries: &VecDeque<Arc<PeerRecord>>, key: &Key) -> Option<usize> {
    entries.iter().position(|record| record.key() == key)
}
