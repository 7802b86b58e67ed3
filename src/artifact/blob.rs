//! Content-addressed blob backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const REF_PREFIX: &str = "sha256:";

/// Reference for a piece of content: `sha256:<hex digest>`.
pub fn content_ref(content: &[u8]) -> String {
    format!("{}{}", REF_PREFIX, hex::encode(Sha256::digest(content)))
}

fn digest_of(content_ref: &str) -> Result<&str> {
    content_ref
        .strip_prefix(REF_PREFIX)
        .filter(|d| d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| Error::validation(format!("malformed content ref '{}'", content_ref)))
}

/// Pluggable persistence for artifact content.
///
/// Identical content maps to the same reference, so storing it twice costs
/// nothing extra.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, content: &[u8]) -> Result<String>;

    async fn get(&self, content_ref: &str) -> Result<Vec<u8>>;

    async fn contains(&self, content_ref: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, content: &[u8]) -> Result<String> {
        let key = content_ref(content);
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs
            .entry(key.clone())
            .or_insert_with(|| Arc::new(content.to_vec()));
        Ok(key)
    }

    async fn get(&self, content_ref: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        blobs
            .get(content_ref)
            .map(|b| b.as_ref().clone())
            .ok_or_else(|| Error::NotFound(format!("blob {}", content_ref)))
    }

    async fn contains(&self, content_ref: &str) -> Result<bool> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(content_ref))
    }
}

/// Blobs as files under `<root>/<first two hex chars>/<digest>`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, content_ref: &str) -> Result<PathBuf> {
        let digest = digest_of(content_ref)?;
        Ok(self.root.join(&digest[..2]).join(digest))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, content: &[u8]) -> Result<String> {
        let key = content_ref(content);
        let path = self.path_for(&key)?;
        if tokio::fs::try_exists(&path).await? {
            tracing::trace!(content_ref = %key, "Blob already stored");
            return Ok(key);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never see a partial blob.
        let tmp = self.root.join(format!(".tmp-{}", ulid::Ulid::new()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(key)
    }

    async fn get(&self, content_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(content_ref)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {}", content_ref)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, content_ref: &str) -> Result<bool> {
        let path = self.path_for(content_ref)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_ref_is_stable() {
        let a = content_ref(b"report");
        assert_eq!(a, content_ref(b"report"));
        assert_ne!(a, content_ref(b"report v2"));
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), 7 + 64);
    }

    #[tokio::test]
    async fn test_memory_dedup() {
        let store = MemoryBlobStore::new();
        let a = store.put(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).await.unwrap(), b"same");
    }

    #[tokio::test]
    async fn test_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let key = store.put(b"quarterly exposure").await.unwrap();
        assert!(store.contains(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), b"quarterly exposure");

        let missing = content_ref(b"never stored");
        assert!(matches!(store.get(&missing).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fs_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.get("sha256:../../etc/passwd").await,
            Err(Error::Validation { .. })
        ));
    }
}
