use crate::error::{Result, StashError};
use crate::packer;
use crate::storage::{content_hash, split_hash, KeyIndex};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// A decoded blob: the caller-supplied logical filename plus the payload
/// bytes that followed it on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub origin_path: String,
    pub payload: Bytes,
}

/// BlobStore owns the CAS directory and the key index under it.
///
/// A blob lives at `base/{prefix}/{name}` where the path components come
/// from the SHA-1 of the uncompressed `origin_path || 0x00 || payload`
/// framing. The stored bytes are the zlib-packed framing.
pub struct BlobStore {
    base_dir: PathBuf,
    index: KeyIndex,
}

impl BlobStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let index = KeyIndex::open(&base_dir)?;
        Ok(Self { base_dir, index })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for_hash(&self, hash: &str) -> Result<PathBuf> {
        let (prefix, name) = split_hash(hash)?;
        Ok(self.base_dir.join(prefix).join(name))
    }

    /// Frame a file for hashing and storage: `origin_path || 0x00 || payload`.
    pub fn prepare_raw(origin_path: &str, payload: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(origin_path.len() + 1 + payload.len());
        raw.extend_from_slice(origin_path.as_bytes());
        raw.push(0);
        raw.extend_from_slice(payload);
        raw
    }

    /// Store every file under `root` (a file or a directory tree) and
    /// record the resulting hashes under `key`.
    ///
    /// Files written before a failure are not rolled back; the operation
    /// is not atomic.
    pub async fn store(&self, key: &str, root: &Path) -> Result<Vec<String>> {
        if key.is_empty() {
            return Err(StashError::InvalidRequest("empty key".to_string()));
        }

        let tree = collect_tree(root)?;
        let mut hashes = Vec::with_capacity(tree.len());
        for path in &tree {
            let payload = fs::read(path).await?;
            let raw = Self::prepare_raw(&path.to_string_lossy(), &payload);
            let hash = self.write_from_raw(&raw).await?;
            hashes.push(hash);
        }

        self.index.add(key, &hashes)?;
        Ok(hashes)
    }

    /// Hash, compress and persist framed bytes. Returns the content hash.
    pub async fn write_from_raw(&self, data: &[u8]) -> Result<String> {
        let hash = content_hash(data);
        let compressed = packer::pack(data);
        self.write_compressed(&hash, &compressed).await?;
        Ok(hash)
    }

    /// Write already-compressed bytes under `hash`.
    ///
    /// An existing file with identical bytes counts as a successful
    /// deduplication (`Ok(true)`); differing bytes are a collision.
    async fn write_compressed(&self, hash: &str, compressed: &[u8]) -> Result<bool> {
        let target = self.path_for_hash(hash)?;

        if target.exists() {
            let existing = fs::read(&target).await?;
            if existing == compressed {
                return Ok(true);
            }
            return Err(StashError::Collision(format!(
                "blob '{}' already exists with different content",
                hash
            )));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = target.with_extension(format!("{}.tmp", ulid::Ulid::new()));
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(compressed).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &target).await?;
        Ok(false)
    }

    /// Persist bytes a peer already compressed, then index them.
    ///
    /// Replays of the same `(key, hash)` pair succeed so that replicated
    /// and re-delivered transfers stay idempotent.
    pub async fn save_compressed(&self, key: &str, hash: &str, data: &[u8]) -> Result<()> {
        let reused = self.write_compressed(hash, data).await?;
        if reused {
            tracing::debug!(hash, "blob already on disk, deduplicated");
        }
        self.index_pair(key, hash)
    }

    /// Build the raw framing for an incoming file, persist it and index
    /// it. Returns the content hash.
    pub async fn save_raw(&self, key: &str, origin_path: &str, payload: &[u8]) -> Result<String> {
        let raw = Self::prepare_raw(origin_path, payload);
        let hash = self.write_from_raw(&raw).await?;
        self.index_pair(key, &hash)?;
        Ok(hash)
    }

    fn index_pair(&self, key: &str, hash: &str) -> Result<()> {
        match self.index.add(key, std::slice::from_ref(&hash.to_string())) {
            Err(StashError::AlreadyExists(_))
                if self.index.key_for_hash(hash)?.as_deref() == Some(key) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    /// Decode every blob recorded under `key`, in insertion order.
    pub async fn get(&self, key: &str) -> Result<Vec<Blob>> {
        let hashes = self.index.get_by_key(key)?;
        let mut blobs = Vec::with_capacity(hashes.len());
        for hash in &hashes {
            let compressed = self.read_by_hash(hash).await?;
            let raw = packer::unpack(&compressed)?;
            blobs.push(Self::decode_blob(&raw)?);
        }
        Ok(blobs)
    }

    /// Compressed on-disk bytes for `hash`.
    pub async fn read_by_hash(&self, hash: &str) -> Result<Bytes> {
        let path = self.path_for_hash(hash)?;
        if !path.exists() {
            return Err(StashError::NotFound(format!("no blob for hash '{}'", hash)));
        }
        let bytes = fs::read(path).await?;
        Ok(Bytes::from(bytes))
    }

    /// Split unpacked framing at the first NUL into origin path and
    /// payload.
    pub fn decode_blob(raw: &[u8]) -> Result<Blob> {
        let Some(nul) = raw.iter().position(|b| *b == 0) else {
            return Err(StashError::Decode(
                "blob framing is missing the header terminator".to_string(),
            ));
        };

        let origin_path = std::str::from_utf8(&raw[..nul])
            .map_err(|error| StashError::Decode(format!("blob header is not UTF-8: {}", error)))?
            .to_string();

        Ok(Blob {
            origin_path,
            payload: Bytes::copy_from_slice(&raw[nul + 1..]),
        })
    }

    /// Drop every blob recorded under `key`, then the index rows.
    pub async fn remove_by_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StashError::InvalidRequest("empty key".to_string()));
        }

        for hash in self.index.get_by_key(key)? {
            self.remove_by_hash(&hash).await?;
        }
        self.index.remove_by_key(key)
    }

    /// Delete the blob file for `hash`; the parent prefix directory is
    /// removed too once it empties out.
    pub async fn remove_by_hash(&self, hash: &str) -> Result<()> {
        let path = self.path_for_hash(hash)?;
        if !path.exists() {
            return Err(StashError::NotFound(format!("no blob for hash '{}'", hash)));
        }

        fs::remove_file(&path).await?;

        if let Some(parent) = path.parent() {
            if std::fs::read_dir(parent)?.next().is_none() {
                fs::remove_dir(parent).await?;
            }
        }
        Ok(())
    }

    /// Write decoded blobs back out as a file tree rooted at `root`.
    ///
    /// An existing target with identical bytes is skipped; one with
    /// different bytes is reported as a collision the user must resolve
    /// by hand. Atomicity is file-local only.
    pub async fn recreate_tree(root: &Path, blobs: &[Blob]) -> Result<()> {
        fs::create_dir_all(root).await?;

        for blob in blobs {
            let full_path = root.join(&blob.origin_path);
            if full_path.exists() {
                let existing = fs::read(&full_path).await?;
                if existing == blob.payload {
                    continue;
                }
                return Err(StashError::Collision(format!(
                    "file '{}' already exists and differs from the stashed content, \
                     remove it manually to avoid overwriting",
                    full_path.display()
                )));
            }

            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&full_path, &blob.payload).await?;
        }
        Ok(())
    }

    /// Hashes recorded under `key`, in insertion order.
    pub fn hashes_by_key(&self, key: &str) -> Result<Vec<String>> {
        self.index.get_by_key(key)
    }

    /// One page of distinct keys for the rebalance walk.
    pub fn keys_by_chunks(&self, offset: usize) -> Result<Vec<String>> {
        self.index.keys_by_chunks(offset)
    }
}

/// Enumerate the files under `root` (which may itself be a file) in a
/// stable depth-first order, skipping directories.
fn collect_tree(root: &Path) -> Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(root)?;
    if metadata.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(root)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();

    let mut files = Vec::new();
    for entry in entries {
        if entry.is_dir() {
            files.extend(collect_tree(&entry)?);
        } else {
            files.push(entry);
        }
    }
    Ok(files)
}
