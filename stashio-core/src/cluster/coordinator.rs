use crate::cluster::client::PeerClient;
use crate::cluster::types::{KeyHashPair, NodeInfo};
use crate::error::{Result, StashError};
use crate::ring::{HashRing, Node};
use crate::storage::{BlobStore, CHUNK_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone)]
pub struct CoordinatorOpts {
    /// Address peers reach this node at; ownership checks compare
    /// against it.
    pub advertise_addr: String,
    pub sync_node: Option<String>,
    pub announce_new: bool,
    pub health_check_interval: Duration,
    pub replication_factor: usize,
}

/// Drives this node's participation in the cluster: bootstrap on
/// startup, then the health-check, rebase and replication loops.
pub struct Coordinator {
    opts: CoordinatorOpts,
    ring: Arc<HashRing>,
    store: Arc<BlobStore>,
    peers: PeerClient,
}

impl Coordinator {
    pub fn new(
        opts: CoordinatorOpts,
        ring: Arc<HashRing>,
        store: Arc<BlobStore>,
        peers: PeerClient,
    ) -> Self {
        Self {
            opts,
            ring,
            store,
            peers,
        }
    }

    /// Sync membership from the configured peer and announce ourselves.
    /// Any failure here aborts startup: the cluster must agree on
    /// membership before this node serves traffic.
    pub async fn bootstrap(&self) -> Result<()> {
        if let Some(sync_node) = &self.opts.sync_node {
            let nodes = self.peers.sync_nodes(sync_node).await?;
            let count = nodes.len();
            for info in nodes {
                self.ring.add_node(Node::new(info.address));
            }
            tracing::info!(sync_node, count, "merged membership from sync node");
        }

        if self.opts.announce_new {
            let members = self.ring.nodes();
            if members.is_empty() {
                return Err(StashError::Internal(
                    "cannot announce new node, hash ring is empty".to_string(),
                ));
            }

            let this_node = NodeInfo {
                address: self.opts.advertise_addr.clone(),
                alive: false,
            };
            for member in members {
                if member.address == self.opts.advertise_addr {
                    continue;
                }
                self.peers.announce_new(&member.address, &this_node).await?;
                tracing::info!(target = %member.address, "announced this node");
            }
        }

        Ok(())
    }

    /// Start the three long-running loops. All of them stop when the
    /// shutdown channel fires or their input channel closes.
    pub fn spawn_loops(
        self: Arc<Self>,
        rebase_rx: mpsc::Receiver<()>,
        replication_rx: mpsc::Receiver<KeyHashPair>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let coordinator = self.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { coordinator.health_loop(shutdown).await });

        let coordinator = self.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { coordinator.rebase_loop(rebase_rx, shutdown).await });

        tokio::spawn(async move { self.replication_loop(replication_rx, shutdown_rx).await });
    }

    async fn health_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.opts.health_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let nodes = self.ring.nodes();
                    if nodes.is_empty() {
                        continue;
                    }
                    tracing::debug!(nodes = nodes.len(), "dispatching health checks");
                    let probed = self.peers.check_health(nodes).await;
                    for node in probed {
                        self.ring.set_alive(&node.address, node.alive);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn rebase_loop(
        &self,
        mut rebase_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                token = rebase_rx.recv() => {
                    if token.is_none() {
                        break;
                    }
                    tracing::info!("rebase signal received, rebalancing keys");
                    if let Err(error) = self.rebalance().await {
                        tracing::error!(%error, "rebalance pass failed, will retry on next signal");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn replication_loop(
        &self,
        mut replication_rx: mpsc::Receiver<KeyHashPair>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                pair = replication_rx.recv() => {
                    let Some(pair) = pair else { break };
                    self.replicate(pair).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Walk the key index in chunks and hand every key this node no
    /// longer owns to its owner. Local rows are dropped only after the
    /// whole key transferred, so delivery is at-least-once and the
    /// receiving side deduplicates by content hash.
    pub async fn rebalance(&self) -> Result<()> {
        let mut offset = 0;
        loop {
            let keys = self.store.keys_by_chunks(offset)?;
            let moves = self.plan_moves(&keys)?;

            for (key, owner) in &moves {
                self.hand_off(key, owner).await?;
                self.store.remove_by_key(key).await?;
            }

            if keys.len() < CHUNK_SIZE {
                break;
            }
            offset += CHUNK_SIZE;
        }
        Ok(())
    }

    /// Keys in this page that belong to another node, paired with their
    /// owner. A dead owner aborts the chunk: moving data to a node that
    /// cannot acknowledge it would risk the local copy.
    fn plan_moves(&self, keys: &[String]) -> Result<Vec<(String, Node)>> {
        let mut moves = Vec::new();
        for key in keys {
            let owner = self.ring.node_for_key(key)?;
            if owner.address == self.opts.advertise_addr {
                continue;
            }
            if !owner.alive {
                return Err(StashError::Unavailable(format!(
                    "owner {} for key '{}' is not alive",
                    owner.address, key
                )));
            }
            moves.push((key.clone(), owner));
        }
        Ok(moves)
    }

    async fn hand_off(&self, key: &str, owner: &Node) -> Result<()> {
        let hashes = self.store.hashes_by_key(key)?;
        for hash in &hashes {
            let path = self.store.path_for_hash(hash)?;
            self.peers
                .send_chunks(&owner.address, key, hash, &path)
                .await?;
        }
        tracing::info!(key, owner = %owner.address, blobs = hashes.len(), "handed off key");
        Ok(())
    }

    /// Fan one stored blob out to the next R-1 nodes on the ring. Replica
    /// failures are logged, never surfaced to the original writer.
    async fn replicate(&self, pair: KeyHashPair) {
        if self.opts.replication_factor <= 1 {
            return;
        }

        let path = match self.store.path_for_hash(&pair.hash) {
            Ok(path) => path,
            Err(error) => {
                tracing::warn!(%error, key = %pair.key, "skipping replication of malformed hash");
                return;
            }
        };

        let replicas = self
            .ring
            .next_nodes(&pair.key, self.opts.replication_factor - 1);
        for replica in replicas {
            if replica.address == self.opts.advertise_addr {
                continue;
            }
            match self
                .peers
                .send_chunks(&replica.address, &pair.key, &pair.hash, &path)
                .await
            {
                Ok(size) => {
                    tracing::debug!(key = %pair.key, replica = %replica.address, size, "replica stored");
                }
                Err(error) => {
                    tracing::warn!(%error, key = %pair.key, replica = %replica.address, "replica transfer failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_coordinator(advertise_addr: &str) -> (tempfile::TempDir, Coordinator, Arc<HashRing>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::open(dir.path().join("stash")).unwrap());
        let ring = Arc::new(HashRing::new());
        let coordinator = Coordinator::new(
            CoordinatorOpts {
                advertise_addr: advertise_addr.to_string(),
                sync_node: None,
                announce_new: false,
                health_check_interval: Duration::from_secs(10),
                replication_factor: 0,
            },
            ring.clone(),
            store,
            PeerClient::new(Duration::from_secs(1)),
        );
        (dir, coordinator, ring)
    }

    #[test]
    fn test_plan_moves_skips_self_owned_keys() {
        let (_dir, coordinator, ring) = sample_coordinator("127.0.0.1:5555");
        ring.add_node(Node {
            address: "127.0.0.1:5555".to_string(),
            alive: true,
        });

        let keys = vec!["alpha".to_string(), "beta".to_string()];
        let moves = coordinator.plan_moves(&keys).unwrap();
        assert!(moves.is_empty());
    }

    #[test]
    fn test_plan_moves_rejects_dead_owner() {
        let (_dir, coordinator, ring) = sample_coordinator("127.0.0.1:5555");
        // only a foreign, dead node in the ring: every key maps to it
        ring.add_node(Node::new("127.0.0.1:5556"));

        let keys = vec!["alpha".to_string()];
        let err = coordinator.plan_moves(&keys).unwrap_err();
        assert!(matches!(err, StashError::Unavailable(_)));
    }

    #[test]
    fn test_plan_moves_selects_foreign_owners() {
        let (_dir, coordinator, ring) = sample_coordinator("127.0.0.1:5555");
        ring.add_node(Node {
            address: "127.0.0.1:5556".to_string(),
            alive: true,
        });

        let keys = vec!["alpha".to_string(), "beta".to_string()];
        let moves = coordinator.plan_moves(&keys).unwrap();
        assert_eq!(moves.len(), 2);
        assert!(moves
            .iter()
            .all(|(_, owner)| owner.address == "127.0.0.1:5556"));
    }

    #[tokio::test]
    async fn test_replicate_is_a_no_op_without_replication_factor() {
        let (_dir, coordinator, ring) = sample_coordinator("127.0.0.1:5555");
        ring.add_node(Node {
            address: "127.0.0.1:5556".to_string(),
            alive: true,
        });

        // factor 0 means primary-only: no outbound traffic, no panic
        coordinator
            .replicate(KeyHashPair {
                key: "alpha".to_string(),
                hash: "0123456789abcdef0123456789abcdef01234567".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_bootstrap_announce_requires_members() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::open(dir.path().join("stash")).unwrap());
        let coordinator = Coordinator::new(
            CoordinatorOpts {
                advertise_addr: "127.0.0.1:5555".to_string(),
                sync_node: None,
                announce_new: true,
                health_check_interval: Duration::from_secs(10),
                replication_factor: 0,
            },
            Arc::new(HashRing::new()),
            store,
            PeerClient::new(Duration::from_secs(1)),
        );

        let err = coordinator.bootstrap().await.unwrap_err();
        assert!(matches!(err, StashError::Internal(_)));
    }
}
