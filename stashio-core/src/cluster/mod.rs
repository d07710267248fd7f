//! Cluster plane: outbound peer RPC and the coordinator that drives
//! sync-on-join, health checking, rebalancing and replication.

pub mod client;
pub mod coordinator;
pub mod types;

pub use client::{PeerClient, FILE_CHUNK_SIZE};
pub use coordinator::{Coordinator, CoordinatorOpts};
pub use types::{KeyHashPair, NodeInfo};
