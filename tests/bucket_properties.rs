use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use kadnet::{Bucket, InsertOutcome, Key, PeerIdentity, PeerRecord, ProbeOutcome};
use proptest::prelude::*;

const NOW: u64 = 1_000_000;

#[derive(Clone, Debug)]
enum Op {
    Direct { id: u8, at: u64 },
    Indirect { id: u8 },
    MarkDead { id: u8 },
    Resolve { slot: usize, alive: bool },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..16, 1u64..NOW).prop_map(|(id, at)| Op::Direct { id, at }),
        2 => (0u8..16).prop_map(|id| Op::Indirect { id }),
        1 => (0u8..16).prop_map(|id| Op::MarkDead { id }),
        2 => (0usize..4, any::<bool>()).prop_map(|(slot, alive)| Op::Resolve { slot, alive }),
    ]
}

fn identity(id: u8) -> PeerIdentity {
    PeerIdentity::new(
        Key::from_bytes(vec![0x80 | id, 0]),
        SocketAddr::from(([127, 0, 0, 1], 5000 + u16::from(id))),
    )
}

proptest! {
    #[test]
    fn bucket_invariants_hold(max_size in 1usize..5, ops in prop::collection::vec(op(), 1..64)) {
        let bucket = Bucket::new(max_size, Duration::from_millis(10_000));
        let mut pending = Vec::new();
        let mut last_len = 0;

        for op in ops {
            match op {
                Op::Direct { id, at } => {
                    let outcome = bucket.insert(PeerRecord::contacted(identity(id), at), NOW);
                    if let InsertOutcome::ProbeRequired(eviction) = outcome {
                        pending.push(eviction);
                    }
                }
                Op::Indirect { id } => {
                    let outcome = bucket.insert(PeerRecord::indirect(identity(id)), NOW);
                    if let InsertOutcome::ProbeRequired(eviction) = outcome {
                        pending.push(eviction);
                    }
                }
                Op::MarkDead { id } => {
                    bucket.mark_dead(&identity(id).key);
                }
                Op::Resolve { slot, alive } => {
                    if !pending.is_empty() {
                        let eviction = pending.remove(slot % pending.len());
                        let outcome = if alive {
                            ProbeOutcome::Alive
                        } else {
                            ProbeOutcome::Unreachable
                        };
                        bucket.complete_probe(eviction, outcome, NOW);
                    }
                }
            }

            let peers = bucket.peers();
            let unique: HashSet<_> = peers.iter().map(|p| p.key.clone()).collect();
            prop_assert_eq!(unique.len(), peers.len(), "duplicate key in {:?}", peers);
            prop_assert!(peers.len() <= max_size);
            prop_assert!(peers.len() >= last_len, "bucket shrank");
            last_len = peers.len();
        }
    }

    #[test]
    fn at_most_one_probe_per_head(ids in prop::collection::vec(0u8..16, 1..32)) {
        let bucket = Bucket::new(1, Duration::from_millis(10));
        bucket.insert(PeerRecord::contacted(identity(100), 1), NOW);

        let mut required = 0;
        for id in ids {
            match bucket.insert(PeerRecord::contacted(identity(id), NOW), NOW) {
                InsertOutcome::ProbeRequired(_eviction) => required += 1,
                InsertOutcome::ProbeInFlight => {}
                other => prop_assert!(false, "unexpected outcome {:?}", other),
            }
        }
        prop_assert_eq!(required, 1);
    }
}
