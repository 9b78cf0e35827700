//! The routing table: one [`Bucket`] per shared-prefix length with the local key.
//!
//! Bucket `i` holds peers whose keys share exactly `i` leading bits with the
//! local key, so bucket 0 covers the farthest half of the key space and the
//! last bucket the single closest neighbour.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::bucket::{Bucket, Eviction, InsertOutcome, ProbeOutcome};
use crate::config::KadConfig;
use crate::key::{distance_cmp, Key};
use crate::peer::{now_millis, Observation, PeerIdentity, PeerRecord};
use crate::probe::Prober;

pub struct RoutingTable {
    self_key: Key,
    buckets: Vec<Arc<Bucket>>,
    prober: Arc<dyn Prober>,
    /// Bounds the number of probes in flight.
    probe_slots: Arc<Semaphore>,
}

impl RoutingTable {
    /// `self_key` must be `config.key_size` bytes wide.
    pub fn new(self_key: Key, config: &KadConfig, prober: Arc<dyn Prober>) -> Self {
        debug_assert_eq!(self_key.len(), config.key_size);
        let buckets = (0..config.bucket_count())
            .map(|_| Arc::new(Bucket::new(config.bucket_size, config.valid_timespan())))
            .collect();
        Self {
            self_key,
            buckets,
            prober,
            probe_slots: Arc::new(Semaphore::new(config.probe_workers)),
        }
    }

    pub fn self_key(&self) -> &Key {
        &self.self_key
    }

    /// Index of the bucket responsible for `key`.
    ///
    /// `None` for the local key and for keys of the wrong width.
    pub fn bucket_index(&self, key: &Key) -> Option<usize> {
        if key.len() != self.self_key.len() || *key == self.self_key {
            return None;
        }
        Some(self.self_key.shared_prefix_len(key))
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index).map(|bucket| bucket.as_ref())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Record an observation of `identity`.
    ///
    /// When the owning bucket needs its head probed, the probe is started on a
    /// worker and this returns [`InsertOutcome::ProbeDispatched`] without
    /// waiting for it.
    pub fn insert(&self, identity: PeerIdentity, observation: Observation) -> InsertOutcome {
        let Some(index) = self.bucket_index(&identity.key) else {
            return InsertOutcome::Ignored;
        };
        let record = PeerRecord::from_observation(identity, observation);
        match self.buckets[index].insert(record, now_millis()) {
            InsertOutcome::ProbeRequired(eviction) => self.dispatch_probe(index, eviction),
            outcome => outcome,
        }
    }

    /// Flag a peer as dead and move it to the head of its bucket.
    pub fn mark_dead(&self, identity: &PeerIdentity) -> bool {
        match self.bucket_index(&identity.key) {
            Some(index) => self.buckets[index].mark_dead(&identity.key),
            None => false,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.bucket_index(key)
            .is_some_and(|index| self.buckets[index].contains(key))
    }

    pub fn record(&self, key: &Key) -> Option<Arc<PeerRecord>> {
        self.bucket_index(key)
            .and_then(|index| self.buckets[index].record(key))
    }

    /// Every known peer, farthest bucket first, each bucket stalest first.
    pub fn snapshot(&self) -> Vec<PeerIdentity> {
        self.buckets.iter().flat_map(|bucket| bucket.peers()).collect()
    }

    /// Up to `count` known peers by ascending XOR distance to `target`.
    pub fn closest_known(&self, target: &Key, count: usize) -> Vec<PeerIdentity> {
        let mut all = self.snapshot();
        all.sort_by(|a, b| distance_cmp(target, &a.key, &b.key));
        all.truncate(count);
        all
    }

    /// Total number of peers across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    pub fn buckets_in_use(&self) -> usize {
        self.buckets.iter().filter(|bucket| !bucket.is_empty()).count()
    }

    /// Index of the closest non-empty bucket, if any.
    pub fn closest_bucket_in_use(&self) -> Option<usize> {
        self.buckets.iter().rposition(|bucket| !bucket.is_empty())
    }

    fn dispatch_probe(&self, index: usize, eviction: Eviction) -> InsertOutcome {
        let Ok(permit) = Arc::clone(&self.probe_slots).try_acquire_owned() else {
            warn!(peer = %eviction.probed().key, "probe pool saturated, dropping candidate");
            eviction.abandon();
            return InsertOutcome::ProbeSkipped;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!(peer = %eviction.probed().key, "no runtime to probe on, dropping candidate");
            eviction.abandon();
            return InsertOutcome::ProbeSkipped;
        };

        let probed = eviction.probed().clone();
        let bucket = Arc::clone(&self.buckets[index]);
        let prober = Arc::clone(&self.prober);
        debug!(peer = %probed.key, addr = %probed.addr, bucket = index, "probing bucket head");

        runtime.spawn(async move {
            let _permit = permit;
            let outcome = match prober.ping(eviction.probed()).await {
                Ok(()) => ProbeOutcome::Alive,
                Err(err) => {
                    debug!(
                        peer = %eviction.probed().key,
                        addr = %eviction.probed().addr,
                        "probe failed: {err}"
                    );
                    ProbeOutcome::Unreachable
                }
            };
            let replacement = eviction.replacement().key.clone();
            let resolution = bucket.complete_probe(eviction, outcome, now_millis());
            debug!(replacement = %replacement, ?outcome, ?resolution, "probe resolved");
        });

        InsertOutcome::ProbeDispatched { probed }
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("self_key", &self.self_key)
            .field("peers", &self.len())
            .field("buckets_in_use", &self.buckets_in_use())
            .finish()
    }
}
