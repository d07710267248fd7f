use crate::cluster::types::NodeInfo;
use crate::error::{Result, StashError};
use crate::ring::HashRing;
use std::sync::Arc;

/// Resolve the node responsible for a key, refusing to route to a peer
/// whose last observed health status is down.
#[derive(Clone)]
pub struct GetDestinationOperation {
    ring: Arc<HashRing>,
}

impl GetDestinationOperation {
    pub fn new(ring: Arc<HashRing>) -> Self {
        Self { ring }
    }

    pub fn run(&self, key: &str) -> Result<NodeInfo> {
        if key.is_empty() {
            return Err(StashError::InvalidRequest("empty key".to_string()));
        }

        let node = self.ring.node_for_key(key)?;
        if !node.alive {
            return Err(StashError::Unavailable(format!(
                "node {} responsible for key '{}' is unavailable",
                node.address, key
            )));
        }

        Ok(node.into())
    }
}
