use crate::error::{Result, StashError};
use crate::storage::BlobStore;
use bytes::Bytes;
use std::sync::Arc;

/// Persist one buffered chunk stream.
#[derive(Clone)]
pub struct StoreChunksOperation {
    store: Arc<BlobStore>,
}

#[derive(Debug, Clone)]
pub struct StoreChunksRequest {
    pub key: String,
    /// Sender already packed the blob: store the body verbatim under
    /// `content_hash`. Otherwise the body is a plain file payload to be
    /// framed with `file_path`.
    pub compressed: bool,
    pub content_hash: Option<String>,
    pub file_path: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct StoreChunksResult {
    /// Total bytes received on the stream.
    pub size: u64,
    pub content_hash: String,
}

impl StoreChunksOperation {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self { store }
    }

    pub async fn run(&self, request: StoreChunksRequest) -> Result<StoreChunksResult> {
        let StoreChunksRequest {
            key,
            compressed,
            content_hash,
            file_path,
            body,
        } = request;

        if key.is_empty() {
            return Err(StashError::InvalidRequest("empty key".to_string()));
        }
        if body.is_empty() {
            return Err(StashError::InvalidRequest("empty chunk".to_string()));
        }

        let content_hash = if compressed {
            let hash = content_hash
                .filter(|hash| !hash.is_empty())
                .ok_or_else(|| StashError::InvalidRequest("empty hash".to_string()))?;
            self.store.save_compressed(&key, &hash, &body).await?;
            hash
        } else {
            let path = file_path
                .filter(|path| !path.is_empty())
                .ok_or_else(|| StashError::InvalidRequest("empty path".to_string()))?;
            self.store.save_raw(&key, &path, &body).await?
        };

        tracing::debug!(key, hash = %content_hash, size = body.len(), "stored chunk stream");

        Ok(StoreChunksResult {
            size: body.len() as u64,
            content_hash,
        })
    }
}
