use crate::ring::Node;
use serde::{Deserialize, Serialize};

/// Wire representation of a ring member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: String,
    pub alive: bool,
}

impl From<Node> for NodeInfo {
    fn from(node: Node) -> Self {
        Self {
            address: node.address,
            alive: node.alive,
        }
    }
}

impl From<NodeInfo> for Node {
    fn from(info: NodeInfo) -> Self {
        Self {
            address: info.address,
            alive: info.alive,
        }
    }
}

/// Unit of work on the replication channel: one stored blob under one
/// key.
#[derive(Debug, Clone)]
pub struct KeyHashPair {
    pub key: String,
    pub hash: String,
}
