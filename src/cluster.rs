//! Static cluster of nodes wired into a fully connected clique.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{QuorumError, Result};
use crate::processor::KvStore;
use crate::raft::{Node, NodeId};

pub struct Cluster {
    nodes: Vec<Arc<Node>>,
}

impl Cluster {
    /// Construct `n` nodes with mutually open links. Each new node is
    /// seeded with the nodes built before it, then registered with them.
    pub async fn new(n: usize) -> Result<Self> {
        let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(n);
        for _ in 0..n {
            let node = Node::new(Box::new(KvStore::new()), &nodes);
            for prior in &nodes {
                prior.add_peer(&node).await?;
            }
            nodes.push(node);
        }
        Ok(Self { nodes })
    }

    /// Run every node under one cancellation scope. Returns when all
    /// loops have stopped; the first node error (or panic, reported with
    /// the node id) cancels the rest and is returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut set = JoinSet::new();
        for node in &self.nodes {
            let node = node.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let id = node.id();
                // Run the loop in its own task so a panic surfaces here
                // as a join error that still knows which node it was.
                let handle = tokio::spawn(node.run(cancel));
                match handle.await {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => {
                        tracing::error!(node = %id, "node task panicked");
                        Err(QuorumError::NodePanicked(id))
                    }
                    Err(_) => Ok(()),
                }
            });
        }

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            if let Ok(Err(err)) = joined {
                tracing::error!(%err, "node loop failed");
                if first_err.is_none() {
                    first_err = Some(err);
                    cancel.cancel();
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Linear lookup by id.
    pub fn node(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Role;

    #[tokio::test]
    async fn test_new_builds_a_clique() {
        let cluster = Cluster::new(3).await.unwrap();
        assert_eq!(cluster.len(), 3);

        for node in cluster.nodes() {
            let topology = node.topology().await;
            assert_eq!(topology.len(), 2);
            assert!(topology.iter().all(|(_, connected)| *connected));
        }
    }

    #[tokio::test]
    async fn test_nodes_start_as_followers_at_term_minus_one() {
        let cluster = Cluster::new(2).await.unwrap();
        for node in cluster.nodes() {
            assert_eq!(node.role().await, Role::Follower);
            assert_eq!(node.term().await, -1);
            assert_eq!(node.journal_len().await, 0);
            assert!(node.alive());
        }
    }

    #[tokio::test]
    async fn test_node_lookup() {
        let cluster = Cluster::new(2).await.unwrap();
        let id = cluster.nodes()[1].id();

        assert!(cluster.node(id).is_some());
        assert!(cluster.node(uuid::Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let cluster = Arc::new(Cluster::new(2).await.unwrap());
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cluster = cluster.clone();
            let cancel = cancel.clone();
            async move { cluster.run(cancel).await }
        });

        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("cluster must stop after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
