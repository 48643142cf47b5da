//! Command replication: submission, ordering, and state machine agreement.


use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use test_harness::{eventually, TestCluster};

fn command(key: &str, value: &str) -> Value {
    json!({"key": key, "value": value})
}

/// A command submitted to the leader reaches every state machine.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replication_reaches_every_node() {
    let cluster = TestCluster::start(5).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("a leader must be elected");

    leader.request(command("a", "1")).await;

    assert!(
        cluster
            .wait_for_key_everywhere("a", &json!("1"), Duration::from_secs(5))
            .await,
        "a=1 must be applied on all nodes within 5s"
    );

    // Journal invariants hold on every node.
    for node in cluster.cluster.nodes() {
        let len = node.journal_len().await;
        let commit = node.commit_index().await;
        assert!(commit >= 0);
        assert!(commit + 1 <= len);
        for i in 0..len - 1 {
            assert!(node.journal_entry(i).await.term <= node.journal_entry(i + 1).await.term);
        }
    }

    // State machine safety: committed index 0 is identical everywhere.
    let reference = cluster.cluster.nodes()[0].journal_entry(0).await;
    for node in cluster.cluster.nodes() {
        assert_eq!(node.journal_entry(0).await.data, reference.data);
    }

    cluster.shutdown().await;
}

/// A command submitted to a follower is forwarded to the leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_forwards_requests_to_leader() {
    let cluster = TestCluster::start(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("a leader must be elected");

    let follower = cluster
        .cluster
        .nodes()
        .iter()
        .find(|node| node.id() != leader.id())
        .expect("there must be a follower")
        .clone();

    follower.request(command("b", "2")).await;

    assert!(
        cluster
            .wait_for_key_everywhere("b", &json!("2"), Duration::from_secs(10))
            .await,
        "a follower-submitted command must still commit everywhere"
    );

    cluster.shutdown().await;
}

/// Replaying the committed prefix into a fresh map reproduces the dump.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_committed_prefix_replays_to_the_same_dump() {
    let cluster = TestCluster::start(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("a leader must be elected");

    for (key, value) in [("a", "1"), ("b", "2"), ("a", "3")] {
        leader.request(command(key, value)).await;
    }

    assert!(
        cluster
            .wait_for_key_everywhere("a", &json!("3"), Duration::from_secs(15))
            .await,
        "the last write must be applied everywhere"
    );

    for node in cluster.cluster.nodes() {
        let commit = node.commit_index().await;
        let mut replay: BTreeMap<String, Value> = BTreeMap::new();
        for i in 0..=commit {
            let data = node.journal_entry(i).await.data;
            let key = data["key"].as_str().expect("committed record has a key");
            replay.insert(key.to_owned(), data["value"].clone());
        }
        assert_eq!(replay, node.dump().await);
    }

    cluster.shutdown().await;
}

/// A node paused through a leader change catches up after recovery.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovered_node_catches_up_on_the_log() {
    let cluster = TestCluster::start(5).await;

    let first = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("initial leader must be elected");

    first.kill().await;

    let second = cluster
        .wait_for_new_leader(first.id(), Duration::from_secs(15))
        .await
        .expect("a new leader must take over");

    second.request(command("a", "1")).await;

    // The four live nodes commit the entry.
    let live_committed = eventually(Duration::from_secs(10), || {
        let cluster = cluster.cluster.clone();
        let paused = first.id();
        async move {
            for node in cluster.nodes() {
                if node.id() == paused {
                    continue;
                }
                if node.get_key("a").await != Some(json!("1")) {
                    return false;
                }
            }
            true
        }
    })
    .await;
    assert!(live_committed, "live majority must commit the entry");

    first.recover();

    // The recovered node converges: same data at index 0 everywhere.
    let converged = eventually(Duration::from_secs(10), || {
        let cluster = cluster.cluster.clone();
        async move {
            for node in cluster.nodes() {
                let entry = node.journal_entry(0).await;
                if entry.data != command("a", "1") {
                    return false;
                }
            }
            true
        }
    })
    .await;
    assert!(converged, "all journals must agree on index 0 within 10s");

    cluster.shutdown().await;
}
