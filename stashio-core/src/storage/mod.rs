//! Storage modules for stashio
//!
//! Provides the content-addressable blob store and its persistent key
//! index.

pub mod blob_store;
pub mod key_index;

pub use blob_store::{Blob, BlobStore};
pub use key_index::{KeyIndex, CHUNK_SIZE};

use crate::error::{Result, StashError};
use sha1::{Digest, Sha1};

/// Length of the directory prefix carved off the front of a content hash.
pub const PREFIX_LENGTH: usize = 5;

/// Full length of a content hash in lowercase hex characters.
pub const HASH_LENGTH: usize = 40;

/// Compute the content hash of raw (pre-compression) blob bytes:
/// lowercase hex SHA-1.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash raw bytes and split the digest into `(prefix, name)`.
pub fn hash_parts(data: &[u8]) -> (String, String) {
    let hash = content_hash(data);
    let name = hash[PREFIX_LENGTH..].to_string();
    let mut prefix = hash;
    prefix.truncate(PREFIX_LENGTH);
    (prefix, name)
}

/// Split an existing content hash string into `(prefix, name)`.
pub fn split_hash(hash: &str) -> Result<(&str, &str)> {
    if hash.len() <= PREFIX_LENGTH {
        return Err(StashError::InvalidRequest(format!(
            "content hash '{}' is too short",
            hash
        )));
    }
    Ok(hash.split_at(PREFIX_LENGTH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_shape() {
        let hash = content_hash(b"some data here");
        assert_eq!(hash.len(), HASH_LENGTH);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash.to_lowercase());
    }

    #[test]
    fn test_content_hash_deterministic() {
        assert_eq!(content_hash(b"payload"), content_hash(b"payload"));
        assert_ne!(content_hash(b"payload"), content_hash(b"payload2"));
    }

    #[test]
    fn test_hash_parts_split() {
        let (prefix, name) = hash_parts(b"a.jpg\x00HELLO");
        assert_eq!(prefix.len(), PREFIX_LENGTH);
        assert_eq!(name.len(), HASH_LENGTH - PREFIX_LENGTH);
        assert_eq!(format!("{}{}", prefix, name), content_hash(b"a.jpg\x00HELLO"));
    }

    #[test]
    fn test_split_hash_matches_hash_parts() {
        let hash = content_hash(b"abc");
        let (prefix, name) = split_hash(&hash).unwrap();
        let (expected_prefix, expected_name) = hash_parts(b"abc");
        assert_eq!(prefix, expected_prefix);
        assert_eq!(name, expected_name);
    }

    #[test]
    fn test_split_hash_rejects_short_input() {
        assert!(split_hash("abc").is_err());
    }
}
