use crate::cluster::types::NodeInfo;
use crate::error::{Result, StashError};
use crate::ring::Node;
use bytes::Bytes;
use reqwest::{header, Client, Url};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};

/// Size of one streamed chunk when uploading a blob to a peer.
pub const FILE_CHUNK_SIZE: usize = 32 * 1024;

const WORKER_RATIO: usize = 3;
const MIN_WORKER_COUNT: usize = 1;
const MAX_WORKER_COUNT: usize = 8;

/// Deadline for control-plane calls (announce, sync, rebase).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

pub const HEADER_KEY: &str = "x-stashio-key";
pub const HEADER_CONTENT_HASH: &str = "x-stashio-content-hash";
pub const HEADER_COMPRESSED: &str = "x-stashio-compressed";
pub const HEADER_FILE_PATH: &str = "x-stashio-file-path";
pub const HEADER_REPLICATE: &str = "x-stashio-replicate";

#[derive(Debug, Deserialize)]
struct SendStatusPayload {
    size: u64,
}

/// Outbound RPC to peer nodes, plus the health-check worker pool.
#[derive(Clone)]
pub struct PeerClient {
    client: Client,
    request_timeout: Duration,
}

impl PeerClient {
    /// `request_timeout` bounds data-plane transfers; control-plane calls
    /// carry their own 5 second deadline and health probes run without
    /// one.
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            request_timeout,
        }
    }

    /// Stream the compressed blob at `file_path` to `target` in fixed
    /// 32 KiB chunks. Returns the byte count the peer acknowledged.
    pub async fn send_chunks(
        &self,
        target: &str,
        key: &str,
        hash: &str,
        file_path: &Path,
    ) -> Result<u64> {
        let url = parse_url(&format!("http://{}/internal/v1/chunks", target))?;
        let file = tokio::fs::File::open(file_path).await?;

        let stream = futures_util::stream::unfold(file, |mut file| async move {
            let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
            match file.read(&mut buffer).await {
                Ok(0) => None,
                Ok(n) => {
                    buffer.truncate(n);
                    Some((Ok(Bytes::from(buffer)), file))
                }
                Err(error) => Some((Err(error), file)),
            }
        });

        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .header(HEADER_KEY, key)
            .header(HEADER_CONTENT_HASH, hash)
            .header(HEADER_COMPRESSED, "true")
            .header(HEADER_REPLICATE, "false")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|error| StashError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "chunk transfer failed: node={} key={} hash={} status={}",
                target,
                key,
                hash,
                response.status()
            )));
        }

        let payload: SendStatusPayload = response
            .json()
            .await
            .map_err(|error| StashError::Http(error.to_string()))?;
        Ok(payload.size)
    }

    /// Announce a (usually our own) node to `target`.
    pub async fn announce_new(&self, target: &str, node: &NodeInfo) -> Result<()> {
        let url = parse_url(&format!("http://{}/internal/v1/nodes", target))?;
        let response = self
            .client
            .post(url)
            .timeout(CONTROL_TIMEOUT)
            .json(node)
            .send()
            .await
            .map_err(|error| StashError::Http(error.to_string()))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(StashError::AlreadyExists(format!(
                "node {} already tracks {}",
                target, node.address
            )));
        }
        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "announce to {} failed: status={}",
                target,
                response.status()
            )));
        }
        Ok(())
    }

    /// Ask `target` to drop a node from its ring.
    pub async fn announce_remove(&self, target: &str, node: &NodeInfo) -> Result<()> {
        let url = parse_url(&format!("http://{}/internal/v1/nodes", target))?;
        let response = self
            .client
            .delete(url)
            .timeout(CONTROL_TIMEOUT)
            .json(node)
            .send()
            .await
            .map_err(|error| StashError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "remove announce to {} failed: status={}",
                target,
                response.status()
            )));
        }
        Ok(())
    }

    /// Fetch the full ring membership of `target`.
    pub async fn sync_nodes(&self, target: &str) -> Result<Vec<NodeInfo>> {
        let url = parse_url(&format!("http://{}/internal/v1/nodes", target))?;
        let response = self
            .client
            .get(url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|error| StashError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "node sync from {} failed: status={}",
                target,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|error| StashError::Http(error.to_string()))
    }

    /// Tell `target` that membership changed and it should re-evaluate
    /// key ownership. Fire-and-forget on the receiver side.
    pub async fn rebase(&self, target: &str) -> Result<()> {
        let url = parse_url(&format!("http://{}/internal/v1/rebase", target))?;
        let response = self
            .client
            .post(url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|error| StashError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(StashError::Http(format!(
                "rebase signal to {} failed: status={}",
                target,
                response.status()
            )));
        }
        Ok(())
    }

    /// One liveness probe. No deadline: the tick cadence bounds how stale
    /// a hung probe can leave the flag.
    async fn probe(&self, address: &str) -> bool {
        let Ok(url) = parse_url(&format!("http://{}/health", address)) else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Probe every node through a small worker pool and return the
    /// updated records.
    ///
    /// The jobs channel is buffered to the node count and closed before
    /// the workers start draining it; the results channel closes when the
    /// last worker finishes.
    pub async fn check_health(&self, nodes: Vec<Node>) -> Vec<Node> {
        let count = nodes.len();
        if count == 0 {
            return Vec::new();
        }

        let (jobs_tx, jobs_rx) = mpsc::channel::<Node>(count);
        for node in nodes {
            // capacity equals the job count, so this never blocks
            let _ = jobs_tx.send(node).await;
        }
        drop(jobs_tx);

        let jobs = Arc::new(Mutex::new(jobs_rx));
        let (results_tx, mut results_rx) = mpsc::channel::<Node>(count);

        let mut workers = Vec::new();
        for _ in 0..worker_count(count) {
            let jobs = jobs.clone();
            let results = results_tx.clone();
            let client = self.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = jobs.lock().await.recv().await;
                    let Some(mut node) = job else { break };
                    node.alive = client.probe(&node.address).await;
                    let _ = results.send(node).await;
                }
            }));
        }
        drop(results_tx);

        let mut probed = Vec::with_capacity(count);
        while let Some(node) = results_rx.recv().await {
            probed.push(node);
        }
        for worker in workers {
            let _ = worker.await;
        }
        probed
    }
}

fn worker_count(node_count: usize) -> usize {
    (node_count / WORKER_RATIO).clamp(MIN_WORKER_COUNT, MAX_WORKER_COUNT)
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|error| StashError::Http(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_clamps() {
        assert_eq!(worker_count(0), 1);
        assert_eq!(worker_count(1), 1);
        assert_eq!(worker_count(3), 1);
        assert_eq!(worker_count(6), 2);
        assert_eq!(worker_count(12), 4);
        assert_eq!(worker_count(24), 8);
        assert_eq!(worker_count(1000), 8);
    }

    #[tokio::test]
    async fn test_check_health_marks_unreachable_nodes_dead() {
        // nothing listens on these ports; every probe must come back dead,
        // and every node must come back exactly once
        let client = PeerClient::new(Duration::from_secs(1));
        let nodes = vec![
            Node {
                address: "127.0.0.1:1".to_string(),
                alive: true,
            },
            Node {
                address: "127.0.0.1:2".to_string(),
                alive: true,
            },
        ];

        let mut probed = client.check_health(nodes).await;
        probed.sort_by(|a, b| a.address.cmp(&b.address));
        assert_eq!(probed.len(), 2);
        assert!(probed.iter().all(|node| !node.alive));
    }
}
