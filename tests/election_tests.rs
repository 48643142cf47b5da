//! Leader election and failover behavior on a live cluster.


use std::time::Duration;

use quorum_lite::raft::Role;
use test_harness::{eventually, TestCluster};

/// Three nodes elect a leader and settle on one term.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_election_converges_on_one_leader() {
    let cluster = TestCluster::start(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("a leader must be elected within 10s");
    assert!(leader.term().await >= 0);

    // Every node settles on the current leader's term.
    let converged = eventually(Duration::from_secs(10), || {
        let cluster = &cluster;
        async move {
            let Some(leader) = cluster.leader().await else {
                return false;
            };
            let term = leader.term().await;
            for node in cluster.cluster.nodes() {
                if node.term().await != term {
                    return false;
                }
            }
            true
        }
    })
    .await;
    assert!(converged, "all nodes must converge on the leader's term");

    // At most one node claims leadership at the settled term.
    let settled = cluster.leader().await.expect("leader must persist");
    let settled_term = settled.term().await;
    let mut leaders = 0;
    for node in cluster.cluster.nodes() {
        if node.role().await == Role::Leader && node.term().await == settled_term {
            leaders += 1;
        }
    }
    assert_eq!(leaders, 1);

    cluster.shutdown().await;
}

/// Killing the leader triggers a failover; recovering it converges terms.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_after_leader_killed() {
    let cluster = TestCluster::start(3).await;

    let first = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("initial leader must be elected");
    let first_term = first.term().await;

    first.kill().await;
    assert!(!first.alive());

    let second = cluster
        .wait_for_new_leader(first.id(), Duration::from_secs(15))
        .await
        .expect("a new leader must take over within 15s");
    assert_ne!(second.id(), first.id());

    let second_term = second.term().await;
    assert!(
        second_term > first_term,
        "failover must move to a higher term ({second_term} vs {first_term})"
    );

    first.recover();
    assert!(first.alive());

    // The recovered node drains its backlog and adopts the new term.
    let converged = eventually(Duration::from_secs(10), || {
        let first = first.clone();
        async move { first.term().await >= second_term }
    })
    .await;
    assert!(converged, "recovered node must catch up to the new term");

    cluster.shutdown().await;
}
