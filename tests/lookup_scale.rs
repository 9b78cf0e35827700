#[path = "common/mod.rs"]
mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{test_config, NetworkRegistry, TestNode};
use futures::stream::{self, StreamExt};
use kadnet::{distance_cmp, Key, KeyFactory};

const NODE_COUNT: usize = 48;
const K_PARAM: usize = 8;
const TARGET_SAMPLES: usize = 16;
const ORIGINS_PER_TARGET: usize = 4;

struct Sample {
    overlap: f64,
    closest_present: bool,
}

fn perfect_closest(all: &[Key], target: &Key, k: usize) -> Vec<Key> {
    let mut keys = all.to_vec();
    keys.sort_by(|a, b| distance_cmp(target, a, b));
    keys.truncate(k);
    keys
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lookups_converge_on_true_neighbourhood() {
    let registry = Arc::new(NetworkRegistry::default());
    let nodes: Vec<TestNode> = (0..NODE_COUNT)
        .map(|index| TestNode::new(&registry, index as u32 + 1, test_config(K_PARAM)))
        .collect();

    let bootstrap = nodes[0].addr();
    for node in &nodes[1..] {
        node.node.join(&[bootstrap]).await.expect("join via first node");
    }

    let all_keys: Vec<Key> = nodes
        .iter()
        .map(|n| n.node.local_node().key.clone())
        .collect();
    let unique: HashSet<&Key> = all_keys.iter().collect();
    assert_eq!(unique.len(), NODE_COUNT, "seeds must give distinct keys");

    let targets = KeyFactory::new(4, Some(0xfeed));
    let queries: Vec<(usize, Key)> = (0..TARGET_SAMPLES)
        .flat_map(|sample| {
            let target = targets.generate();
            (0..ORIGINS_PER_TARGET)
                .map(move |o| ((sample * 7 + o * 13) % NODE_COUNT, target.clone()))
        })
        .collect();

    let samples: Vec<Sample> = stream::iter(queries)
        .map(|(origin, target)| {
            let node = nodes[origin].node.clone();
            let perfect = perfect_closest(&all_keys, &target, K_PARAM);
            async move {
                let found: Vec<Key> = node
                    .find_node(&target)
                    .await
                    .into_iter()
                    .map(|p| p.key)
                    .collect();
                let hits = found.iter().filter(|k| perfect.contains(k)).count();
                Sample {
                    overlap: hits as f64 / perfect.len() as f64,
                    closest_present: found.first() == perfect.first(),
                }
            }
        })
        .buffer_unordered(8)
        .collect()
        .await;

    let mean = samples.iter().map(|s| s.overlap).sum::<f64>() / samples.len() as f64;
    let closest_rate =
        samples.iter().filter(|s| s.closest_present).count() as f64 / samples.len() as f64;

    assert!(mean >= 0.8, "mean overlap {mean:.2} too low");
    assert!(closest_rate >= 0.9, "closest found in only {closest_rate:.2} of lookups");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_node_is_known_after_joining() {
    let registry = Arc::new(NetworkRegistry::default());
    let nodes: Vec<TestNode> = (0..12)
        .map(|index| TestNode::new(&registry, 100 + index, test_config(K_PARAM)))
        .collect();
    for node in &nodes[1..] {
        node.node.join(&[nodes[0].addr()]).await.expect("join");
    }

    for node in &nodes {
        let others = nodes.iter().filter(|other| {
            other.node.local_node() != node.node.local_node()
                && other.node.routing_table().contains(&node.node.local_node().key)
        });
        assert!(others.count() > 0, "{} is unknown to everyone", node.node.local_node());
    }
    let total: usize = nodes.iter().map(|n| n.node.telemetry().known_peers).sum();
    assert!(total >= nodes.len());
}
