//! Stashio Core - Core library for the distributed content-addressable
//! blob store

pub mod cluster;
pub mod error;
pub mod operations;
pub mod packer;
pub mod ring;
pub mod storage;

pub use cluster::{
    Coordinator, CoordinatorOpts, KeyHashPair, NodeInfo, PeerClient, FILE_CHUNK_SIZE,
};
pub use error::{Result, StashError};
pub use operations::{
    FetchChunksOperation, FetchChunksRequest, GetDestinationOperation, ReceiveInfoOperation,
    StoreChunksOperation, StoreChunksRequest, StoreChunksResult,
};
pub use ring::{hash_key, HashRing, Node};
pub use storage::{
    content_hash, hash_parts, split_hash, Blob, BlobStore, KeyIndex, CHUNK_SIZE, HASH_LENGTH,
    PREFIX_LENGTH,
};
