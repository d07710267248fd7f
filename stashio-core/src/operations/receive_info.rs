use crate::error::{Result, StashError};
use crate::storage::BlobStore;
use std::sync::Arc;

/// List the content hashes recorded under a key.
#[derive(Clone)]
pub struct ReceiveInfoOperation {
    store: Arc<BlobStore>,
}

impl ReceiveInfoOperation {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self { store }
    }

    pub fn run(&self, key: &str) -> Result<Vec<String>> {
        if key.is_empty() {
            return Err(StashError::InvalidRequest("empty key".to_string()));
        }

        let hashes = self.store.hashes_by_key(key)?;
        if hashes.is_empty() {
            return Err(StashError::NotFound(format!(
                "no entries for key '{}'",
                key
            )));
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_info() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobStore::open(dir.path().join("stash")).unwrap());
        let operation = ReceiveInfoOperation::new(store.clone());

        let err = operation.run("").unwrap_err();
        assert!(matches!(err, StashError::InvalidRequest(_)));

        let err = operation.run("photos").unwrap_err();
        assert!(matches!(err, StashError::NotFound(_)));

        let hash = store.save_raw("photos", "a.jpg", b"HELLO").await.unwrap();
        assert_eq!(operation.run("photos").unwrap(), vec![hash]);
    }
}
