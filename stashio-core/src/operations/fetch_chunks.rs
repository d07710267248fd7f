use crate::error::{Result, StashError};
use crate::packer;
use crate::storage::BlobStore;
use bytes::Bytes;
use std::sync::Arc;

/// Read one blob for streaming back to a caller, compressed (peer
/// replication) or decompressed (client read).
#[derive(Clone)]
pub struct FetchChunksOperation {
    store: Arc<BlobStore>,
}

#[derive(Debug, Clone)]
pub struct FetchChunksRequest {
    pub hash: String,
    pub decompress: bool,
}

impl FetchChunksOperation {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self { store }
    }

    pub async fn run(&self, request: FetchChunksRequest) -> Result<Bytes> {
        if request.hash.is_empty() {
            return Err(StashError::InvalidRequest("empty hash".to_string()));
        }

        let compressed = self.store.read_by_hash(&request.hash).await?;
        if !request.decompress {
            return Ok(compressed);
        }

        Ok(Bytes::from(packer::unpack(&compressed)?))
    }
}
