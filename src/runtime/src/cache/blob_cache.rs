//! Content-addressed cache for raw layer blobs.
//!
//! Each blob is stored under its digest, so a blob shared by several images
//! is downloaded once. Entries are written to a temp file and renamed into
//! place; concurrent fillers of the same key race harmlessly because they
//! write identical bytes.

use std::fs::File;
use std::future::Future;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use a3s_rootfs_core::error::{Result, RootfsError};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::digest::SHA256_PREFIX;

/// Temp file prefix for in-flight cache writes.
const TEMP_PREFIX: &str = ".tmp-";

/// A blob present in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlob {
    /// Path to the cached bytes
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

/// Content-addressed blob cache.
///
/// Blobs are stored as flat files under `cache_dir/<digest>` with ':'
/// replaced by '_'. The cache carries no liveness information; it can be
/// emptied at any time and refills on the next miss.
#[derive(Debug)]
pub struct BlobCache {
    /// Root directory for blobs (e.g., <store>/cache/blobs)
    cache_dir: PathBuf,
    /// Re-hash entries on every hit
    verify_on_hit: bool,
}

impl BlobCache {
    /// Create a blob cache at the given directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            RootfsError::CacheError(format!(
                "Failed to create blob cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            verify_on_hit: false,
        })
    }

    /// Re-verify the digest of `sha256:` entries on every hit.
    pub fn with_verify_on_hit(mut self, verify: bool) -> Self {
        self.verify_on_hit = verify;
        self
    }

    /// Return the cached blob for `id`, or fetch it with `producer` and cache it.
    ///
    /// `producer` is only invoked on a miss. Its bytes are verified against
    /// `id` when `id` is a `sha256:` digest; a mismatch caches nothing.
    pub async fn fetch_or_stream<F, Fut>(&self, id: &str, producer: F) -> Result<CachedBlob>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if let Some(hit) = self.get(id)? {
            tracing::debug!(id = %id, size = hit.size, "Blob cache hit");
            return Ok(hit);
        }

        tracing::debug!(id = %id, "Blob cache miss, fetching");
        let content = producer().await?;
        self.put(id, &content)
    }

    /// Look up a cached blob.
    ///
    /// Entries that are not regular files, or that fail verification when
    /// `verify_on_hit` is set, are evicted and reported as a miss.
    pub fn get(&self, id: &str) -> Result<Option<CachedBlob>> {
        let path = self.blob_path(id);

        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RootfsError::CacheError(format!(
                    "Failed to stat cached blob {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        if !meta.is_file() {
            tracing::warn!(id = %id, path = %path.display(), "Evicting non-file blob cache entry");
            self.invalidate(id)?;
            return Ok(None);
        }

        if self.verify_on_hit && id.starts_with(SHA256_PREFIX) {
            let actual = hash_file(&path)?;
            if actual != id {
                tracing::warn!(
                    id = %id,
                    actual = %actual,
                    "Evicting blob cache entry with mismatched digest"
                );
                self.invalidate(id)?;
                return Ok(None);
            }
        }

        Ok(Some(CachedBlob {
            path,
            size: meta.len(),
        }))
    }

    /// Store blob bytes under `id`.
    pub fn put(&self, id: &str, content: &[u8]) -> Result<CachedBlob> {
        if id.starts_with(SHA256_PREFIX) {
            let actual = format!("{}{}", SHA256_PREFIX, hex::encode(Sha256::digest(content)));
            if actual != id {
                return Err(RootfsError::Corrupted {
                    what: format!("blob {}", id),
                    message: format!("fetched content hashes to {}", actual),
                });
            }
        }

        let path = self.blob_path(id);
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.cache_dir)
            .map_err(|e| {
                RootfsError::CacheError(format!(
                    "Failed to create temp file in {}: {}",
                    self.cache_dir.display(),
                    e
                ))
            })?;

        // The temp file is removed on drop if anything below fails
        write_all_synced(&mut tmp, content).map_err(|e| {
            RootfsError::CacheError(format!("Failed to write blob {}: {}", id, e))
        })?;

        if let Err(e) = tmp.persist(&path) {
            // Another process may have renamed identical content into place
            if path.is_file() {
                tracing::debug!(id = %id, "Blob cache entry created concurrently");
            } else {
                return Err(RootfsError::CacheError(format!(
                    "Failed to move blob into place {}: {}",
                    path.display(),
                    e.error
                )));
            }
        }

        tracing::debug!(
            id = %id,
            size = content.len(),
            path = %path.display(),
            "Cached blob"
        );

        Ok(CachedBlob {
            path,
            size: content.len() as u64,
        })
    }

    /// Remove a cached blob. Missing entries are not an error.
    pub fn invalidate(&self, id: &str) -> Result<()> {
        let path = self.blob_path(id);
        remove_entry(&path).map_err(|e| {
            RootfsError::CacheError(format!(
                "Failed to remove cached blob {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Delete every cached blob. Returns the number of entries removed.
    pub fn clean(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self.read_dir()? {
            let path = entry.path();
            remove_entry(&path).map_err(|e| {
                RootfsError::CacheError(format!(
                    "Failed to remove cached blob {}: {}",
                    path.display(),
                    e
                ))
            })?;
            removed += 1;
        }

        tracing::debug!(removed, dir = %self.cache_dir.display(), "Cleaned blob cache");
        Ok(removed)
    }

    /// List the ids of all committed entries.
    pub fn list_entries(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.read_dir()? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(TEMP_PREFIX) {
                    ids.push(Self::filename_to_digest(name));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Get the total size of all cached blobs in bytes.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in self.read_dir()? {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    /// Path a blob is (or would be) cached at.
    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(Self::digest_to_filename(id))
    }

    fn read_dir(&self) -> Result<Vec<std::fs::DirEntry>> {
        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            RootfsError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        read_dir
            .map(|entry| {
                entry.map_err(|e| {
                    RootfsError::CacheError(format!("Failed to read directory entry: {}", e))
                })
            })
            .collect()
    }

    /// Convert a digest string to a safe file name.
    ///
    /// e.g., "sha256:abc123" → "sha256_abc123"
    fn digest_to_filename(digest: &str) -> String {
        digest.replace(':', "_")
    }

    fn filename_to_digest(name: &str) -> String {
        name.replacen('_', ":", 1)
    }
}

fn write_all_synced(tmp: &mut NamedTempFile, content: &[u8]) -> std::io::Result<()> {
    tmp.write_all(content)?;
    tmp.as_file().sync_all()
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Hash a file into a `sha256:<hex>` digest string.
pub(crate) fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_blob_cache_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let cache_dir = tmp.path().join("blobs");

        assert!(!cache_dir.exists());
        let _cache = BlobCache::new(&cache_dir).unwrap();
        assert!(cache_dir.is_dir());
    }

    #[test]
    fn test_get_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        assert!(cache.get("sha256:nonexistent").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_miss_invokes_producer_then_hit_does_not() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        let content = b"layer bytes".to_vec();
        let id = sha256_digest(&content);
        let calls = AtomicUsize::new(0);

        let first = cache
            .fetch_or_stream(&id, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(content.clone())
            })
            .await
            .unwrap();
        assert_eq!(first.size, content.len() as u64);
        assert_eq!(std::fs::read(&first.path).unwrap(), content);

        let second = cache
            .fetch_or_stream(&id, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            })
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_producer_error_leaves_no_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();

        let result = cache
            .fetch_or_stream("sha256:abc", || async {
                Err(RootfsError::Other("network down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.list_entries().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_put_rejects_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();

        let err = cache.put(&sha256_digest(b"expected"), b"tampered").unwrap_err();
        assert!(err.is_corrupted());
        assert!(cache.list_entries().unwrap().is_empty());
    }

    #[test]
    fn test_put_accepts_opaque_ids() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();

        let blob = cache.put("local:layer-1", b"anything").unwrap();
        assert_eq!(blob.path, tmp.path().join("local_layer-1"));
        assert_eq!(cache.list_entries().unwrap(), vec!["local:layer-1"]);
    }

    #[tokio::test]
    async fn test_concurrent_fill_same_digest() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        let content = vec![7u8; 256 * 1024];
        let id = sha256_digest(&content);

        let (a, b) = tokio::join!(
            cache.fetch_or_stream(&id, || async {
                tokio::task::yield_now().await;
                Ok(content.clone())
            }),
            cache.fetch_or_stream(&id, || async {
                tokio::task::yield_now().await;
                Ok(content.clone())
            }),
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(std::fs::read(&a.path).unwrap(), content);
        assert_eq!(cache.list_entries().unwrap(), vec![id]);
    }

    #[test]
    fn test_concurrent_fill_from_threads() {
        let tmp = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(BlobCache::new(tmp.path()).unwrap());
        let content = b"shared base layer".repeat(1000);
        let id = sha256_digest(&content);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let content = content.clone();
                let id = id.clone();
                std::thread::spawn(move || cache.put(&id, &content).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(std::fs::read(cache.blob_path(&id)).unwrap(), content);
        assert_eq!(hash_file(&cache.blob_path(&id)).unwrap(), id);
        assert_eq!(cache.list_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_get_evicts_directory_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        std::fs::create_dir_all(cache.blob_path("sha256:dir")).unwrap();

        assert!(cache.get("sha256:dir").unwrap().is_none());
        assert!(!cache.blob_path("sha256:dir").exists());
    }

    #[test]
    fn test_verify_on_hit_evicts_corrupted_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap().with_verify_on_hit(true);
        let id = sha256_digest(b"good");
        cache.put(&id, b"good").unwrap();

        std::fs::write(cache.blob_path(&id), b"bit rot").unwrap();

        assert!(cache.get(&id).unwrap().is_none());
        assert!(!cache.blob_path(&id).exists());
    }

    #[test]
    fn test_without_verify_on_hit_serves_existing_file() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        let id = sha256_digest(b"good");
        cache.put(&id, b"good").unwrap();
        std::fs::write(cache.blob_path(&id), b"bit rot").unwrap();

        assert!(cache.get(&id).unwrap().is_some());
    }

    #[test]
    fn test_invalidate() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        let id = sha256_digest(b"data");
        cache.put(&id, b"data").unwrap();

        cache.invalidate(&id).unwrap();
        assert!(cache.get(&id).unwrap().is_none());

        // Missing entries are fine
        cache.invalidate("sha256:does_not_exist").unwrap();
    }

    #[test]
    fn test_clean_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        cache.put(&sha256_digest(b"one"), b"one").unwrap();
        cache.put(&sha256_digest(b"two"), b"two").unwrap();
        std::fs::write(tmp.path().join(".tmp-leftover"), b"partial").unwrap();

        assert_eq!(cache.clean().unwrap(), 3);
        assert!(cache.list_entries().unwrap().is_empty());
        assert_eq!(cache.total_size().unwrap(), 0);
    }

    #[test]
    fn test_list_entries_skips_temp_files() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        let id = sha256_digest(b"x");
        cache.put(&id, b"x").unwrap();
        std::fs::write(tmp.path().join(".tmp-inflight"), b"partial").unwrap();

        assert_eq!(cache.list_entries().unwrap(), vec![id]);
    }

    #[test]
    fn test_total_size() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path()).unwrap();
        assert_eq!(cache.total_size().unwrap(), 0);

        cache.put(&sha256_digest(b"hello"), b"hello").unwrap();
        cache.put(&sha256_digest(b"world!"), b"world!").unwrap();
        assert_eq!(cache.total_size().unwrap(), 11);
    }

    #[test]
    fn test_digest_to_filename() {
        assert_eq!(BlobCache::digest_to_filename("sha256:abc123"), "sha256_abc123");
        assert_eq!(BlobCache::filename_to_digest("sha256_abc123"), "sha256:abc123");
    }
}
