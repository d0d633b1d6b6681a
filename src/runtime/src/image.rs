//! Images: named root filesystems built from a base image.
//!
//! An image is a snapshot of its base image's leaf volume at
//! `images/<id>/rootfs`, described by `images/<id>/image.json`. The record
//! file is written last on create and removed first on delete, so an image
//! is listed only while its dependency record exists.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use a3s_rootfs_core::config::StoreConfig;
use a3s_rootfs_core::error::{Result, RootfsError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::BlobCache;
use crate::deps::{image_owner, DependencyManager};
use crate::fs::{dir_size, remove_tree};
use crate::gc::{CollectionReport, GarbageCollector};
use crate::idmap::CommandIdMapper;
use crate::lock::{LockMode, Locksmith, GLOBAL_LOCK};
use crate::puller::{is_incomplete_volume, BaseImagePuller, PullOptions, PulledImage};
use crate::source::{self, Source};
use crate::store::StoreLayout;
use crate::unpack::{LayerUnpacker, NamespacedUnpacker, ReexecCommand};
use crate::volume::{Driver, VolumeDriver};

const RECORD_FILE: &str = "image.json";
const ROOTFS_DIR: &str = "rootfs";

/// Persisted description of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    /// Canonical base image reference
    pub base_image: String,
    /// Layer volumes the rootfs was built from, root first
    pub chain_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Base image configuration, passed through untouched
    pub config: serde_json::Value,
}

/// Disk usage of one image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageStats {
    pub id: String,
    pub base_image: String,
    pub layers: usize,
    /// Apparent size of the rootfs in bytes
    pub disk_usage: u64,
    pub created_at: DateTime<Utc>,
}

/// Space and bookkeeping of the whole store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreUsage {
    pub images: usize,
    pub volumes: usize,
    /// Volumes left by interrupted unpacks; the next clean reclaims them
    pub incomplete_volumes: usize,
    pub volume_bytes: u64,
    pub cached_blobs: usize,
    pub cache_bytes: u64,
    /// Images and base images holding a dependency record
    pub dependency_owners: usize,
}

/// Image directories under `images/`.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            RootfsError::Other(format!(
                "Failed to create image directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn image_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn rootfs_path(&self, id: &str) -> PathBuf {
        self.image_dir(id).join(ROOTFS_DIR)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.image_dir(id).join(RECORD_FILE)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).is_file()
    }

    /// Ids of every image with a record, sorted. Records are not parsed.
    pub fn ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().to_string();
            if self.exists(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn read(&self, id: &str) -> Result<ImageRecord> {
        let path = self.record_path(id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RootfsError::not_found("image", id))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| RootfsError::Corrupted {
            what: format!("image record {}", path.display()),
            message: e.to_string(),
        })
    }

    /// Records of every image. Unreadable records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let mut records = Vec::new();
        for id in self.ids()? {
            match self.read(&id) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(image = %id, error = %e, "Skipping unreadable image"),
            }
        }
        Ok(records)
    }

    pub fn write(&self, record: &ImageRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;

        std::fs::write(&tmp_path, json).map_err(|e| {
            RootfsError::Other(format!(
                "Failed to write image record {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            RootfsError::Other(format!(
                "Failed to rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })
    }

    fn remove_record(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.record_path(id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn remove_dir(&self, id: &str) -> Result<()> {
        let dir = self.image_dir(id);
        remove_tree(&dir).map_err(|e| {
            RootfsError::Other(format!(
                "Failed to remove image directory {}: {}",
                dir.display(),
                e
            ))
        })
    }
}

/// Image ids become directory names and lock keys.
pub fn validate_image_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(RootfsError::ConfigError(format!(
            "invalid image id '{}': use letters, digits, '-', '_', '.' or ':'",
            id
        )))
    }
}

/// Front door of the store: pulls base images, builds and removes images,
/// and runs garbage collection under the store locks.
pub struct ImageManager {
    layout: StoreLayout,
    images: ImageStore,
    driver: Arc<dyn VolumeDriver>,
    cache: Arc<BlobCache>,
    deps: DependencyManager,
    locks: Locksmith,
    unpacker: Arc<dyn LayerUnpacker>,
    source: Option<Arc<dyn Source>>,
    config: StoreConfig,
}

impl ImageManager {
    /// Open the store described by `config`, unpacking layers through a
    /// re-exec of the running binary.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mapper = Arc::new(CommandIdMapper::from_tools(&config.tools));
        let mut reexec = ReexecCommand::current_exe()?;
        reexec.args.push(OsString::from("--tar"));
        reexec.args.push(config.tools.tar.clone().into_os_string());
        let unpacker = Arc::new(NamespacedUnpacker::new(reexec, mapper));
        Self::new(config, unpacker)
    }

    pub fn new(config: StoreConfig, unpacker: Arc<dyn LayerUnpacker>) -> Result<Self> {
        let layout = StoreLayout::new(&config.store_path);
        layout.ensure()?;

        let driver: Arc<dyn VolumeDriver> =
            Arc::new(Driver::new(config.driver, &layout.volumes_dir(), &config.tools)?);
        let cache = Arc::new(
            BlobCache::new(&layout.blobs_dir())?.with_verify_on_hit(config.cache.verify_on_hit),
        );

        tracing::debug!(
            store = %layout.root().display(),
            driver = %config.driver,
            user_namespace = config.has_id_mappings(),
            "Opened rootfs store"
        );

        Ok(Self {
            images: ImageStore::new(&layout.images_dir())?,
            deps: DependencyManager::new(&layout.dependencies_dir())?,
            locks: Locksmith::new(&layout.locks_dir())?,
            layout,
            driver,
            cache,
            unpacker,
            source: None,
            config,
        })
    }

    /// Serve every reference from `source` instead of picking one per reference.
    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout()
    }

    fn puller(&self, reference: &str) -> Result<BaseImagePuller> {
        let source = match &self.source {
            Some(source) => source.clone(),
            None => source::open(reference, &self.config.registry)?,
        };
        Ok(BaseImagePuller::new(
            source,
            self.cache.clone(),
            self.driver.clone(),
            self.unpacker.clone(),
            self.deps.clone(),
        ))
    }

    fn pull_options(&self) -> PullOptions {
        PullOptions {
            uid_mappings: self.config.uid_mappings.clone(),
            gid_mappings: self.config.gid_mappings.clone(),
        }
    }

    /// Pull a base image without building an image from it.
    pub async fn pull(&self, reference: &str, cancel: &CancellationToken) -> Result<PulledImage> {
        let _global = self
            .locks
            .lock_with_timeout(GLOBAL_LOCK, LockMode::Shared, self.lock_timeout(), cancel)
            .await?;
        self.puller(reference)?
            .pull(reference, &self.pull_options(), cancel)
            .await
    }

    /// Build image `id` from `base_image`.
    pub async fn create(
        &self,
        id: &str,
        base_image: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord> {
        validate_image_id(id)?;

        let _global = self
            .locks
            .lock_with_timeout(GLOBAL_LOCK, LockMode::Shared, self.lock_timeout(), cancel)
            .await?;
        let _image = self
            .locks
            .lock_with_timeout(&image_owner(id), LockMode::Exclusive, self.lock_timeout(), cancel)
            .await?;

        if self.images.exists(id) {
            return Err(RootfsError::Other(format!("Image {} already exists", id)));
        }
        // Debris from an interrupted create
        self.discard_image_dir(id).await;

        let pulled = self
            .puller(base_image)?
            .pull(base_image, &self.pull_options(), cancel)
            .await?;

        if let Err(e) = self.compose(id, &pulled).await {
            self.discard_image_dir(id).await;
            return Err(e);
        }

        let record = ImageRecord {
            id: id.to_string(),
            base_image: pulled.reference.clone(),
            chain_ids: pulled.info.chain_ids(),
            created_at: Utc::now(),
            config: pulled.info.config.clone(),
        };

        let committed = match self.deps.register(&image_owner(id), &record.chain_ids) {
            Ok(()) => self.images.write(&record),
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            let _ = self.deps.deregister(&image_owner(id));
            self.discard_image_dir(id).await;
            return Err(e);
        }

        tracing::info!(
            image = %id,
            base = %record.base_image,
            layers = record.chain_ids.len(),
            "Created image"
        );
        Ok(record)
    }

    /// Snapshot the leaf volume into the image's rootfs.
    async fn compose(&self, id: &str, pulled: &PulledImage) -> Result<()> {
        let image_dir = self.images.image_dir(id);
        std::fs::create_dir_all(&image_dir).map_err(|e| {
            RootfsError::Other(format!(
                "Failed to create image directory {}: {}",
                image_dir.display(),
                e
            ))
        })?;

        let rootfs = self.images.rootfs_path(id);
        match pulled.info.leaf() {
            Some(leaf) => {
                let leaf_path = self.driver.volume_path(&leaf.chain_id);
                self.driver.snapshot(&leaf_path, &rootfs).await
            }
            None => std::fs::create_dir(&rootfs).map_err(|e| {
                RootfsError::Other(format!(
                    "Failed to create rootfs {}: {}",
                    rootfs.display(),
                    e
                ))
            }),
        }
    }

    async fn discard_image_dir(&self, id: &str) {
        let rootfs = self.images.rootfs_path(id);
        if rootfs.exists() {
            if let Err(e) = self.driver.destroy_snapshot(&rootfs).await {
                tracing::warn!(image = %id, error = %e, "Failed to remove rootfs snapshot");
            }
        }
        if let Err(e) = self.images.remove_dir(id) {
            tracing::warn!(image = %id, error = %e, "Failed to remove image directory");
        }
    }

    /// Remove image `id`. Its volumes stay until the next collection.
    pub async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        validate_image_id(id)?;

        let _global = self
            .locks
            .lock_with_timeout(GLOBAL_LOCK, LockMode::Shared, self.lock_timeout(), cancel)
            .await?;
        let _image = self
            .locks
            .lock_with_timeout(&image_owner(id), LockMode::Exclusive, self.lock_timeout(), cancel)
            .await?;

        if !self.images.exists(id) {
            return Err(RootfsError::not_found("image", id));
        }

        self.images.remove_record(id)?;
        let rootfs = self.images.rootfs_path(id);
        if rootfs.exists() {
            self.driver.destroy_snapshot(&rootfs).await?;
        }
        self.images.remove_dir(id)?;
        self.deps.deregister(&image_owner(id))?;

        tracing::info!(image = %id, "Deleted image");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        self.images.list()
    }

    pub fn get(&self, id: &str) -> Result<ImageRecord> {
        validate_image_id(id)?;
        self.images.read(id)
    }

    pub async fn stats(&self, id: &str) -> Result<ImageStats> {
        let record = self.get(id)?;
        let rootfs = self.images.rootfs_path(id);
        let disk_usage = tokio::task::spawn_blocking(move || dir_size(&rootfs))
            .await
            .map_err(|e| RootfsError::Other(format!("Usage scan failed: {}", e)))?;

        Ok(ImageStats {
            id: record.id,
            base_image: record.base_image,
            layers: record.chain_ids.len(),
            disk_usage,
            created_at: record.created_at,
        })
    }

    /// Usage of the store as a whole.
    pub async fn store_usage(&self) -> Result<StoreUsage> {
        let volumes = self.driver.volumes().await?;
        Ok(StoreUsage {
            images: self.images.ids()?.len(),
            incomplete_volumes: volumes.iter().filter(|id| is_incomplete_volume(id)).count(),
            volumes: volumes.len(),
            volume_bytes: self.driver.usage().await?,
            cached_blobs: self.cache.list_entries()?.len(),
            cache_bytes: self.cache.total_size()?,
            dependency_owners: self.deps.owners()?.len(),
        })
    }

    /// Bytes used by all layer volumes.
    pub async fn volume_usage(&self) -> Result<u64> {
        self.driver.usage().await
    }

    /// Collect unreferenced volumes.
    ///
    /// With a `threshold`, nothing happens unless volume usage exceeds it;
    /// `None` is returned in that case.
    pub async fn clean(
        &self,
        threshold: Option<u64>,
        keep_images: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<CollectionReport>> {
        let _global = self
            .locks
            .lock_with_timeout(GLOBAL_LOCK, LockMode::Exclusive, self.lock_timeout(), cancel)
            .await?;

        if let Some(threshold) = threshold {
            let usage = self.driver.usage().await?;
            if usage <= threshold {
                tracing::info!(usage, threshold, "Volume usage below threshold, skipping collection");
                return Ok(None);
            }
            tracing::info!(usage, threshold, "Volume usage above threshold");
        }

        let images = self.images.ids()?;
        self.repair_dependency_records(&images)?;

        let gc = GarbageCollector::new(self.driver.clone(), self.deps.clone(), self.cache.clone());
        gc.collect(&images, keep_images, cancel).await.map(Some)
    }

    /// Rewrite missing or malformed `image:<id>` records from the image
    /// records, which list the same chain IDs. An image whose own record is
    /// unreadable leaves liveness unknown and fails the pass.
    fn repair_dependency_records(&self, images: &[String]) -> Result<()> {
        for id in images {
            let owner = image_owner(id);
            match self.deps.dependencies(&owner) {
                Ok(_) => continue,
                Err(e) if e.is_not_found() || e.is_corrupted() => {
                    tracing::warn!(image = %id, error = %e, "Rebuilding dependency record");
                }
                Err(e) => return Err(e),
            }
            let record = self.images.read(id)?;
            self.deps.register(&owner, &record.chain_ids)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::base_image_owner;
    use crate::source::testing::MemorySource;
    use crate::unpack::testing::CopyUnpacker;
    use a3s_rootfs_core::config::DriverKind;
    use tempfile::TempDir;

    const BASE: &str = "docker.io/library/base:1";
    const OTHER: &str = "docker.io/library/other:1";

    struct Harness {
        tmp: TempDir,
        source: Arc<MemorySource>,
        manager: ImageManager,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            store_path: tmp.path().join("store"),
            driver: DriverKind::Dir,
            lock_timeout_secs: 1,
            ..Default::default()
        };
        let source = Arc::new(MemorySource::default());
        source.add_image(
            BASE,
            &[
                (b"base root".to_vec(), "sha256:diffA".to_string()),
                (b"base top".to_vec(), "sha256:diffB".to_string()),
            ],
        );
        source.add_image(
            OTHER,
            &[(b"other root".to_vec(), "sha256:diffC".to_string())],
        );
        let manager = ImageManager::new(config, Arc::new(CopyUnpacker::default()))
            .unwrap()
            .with_source(source.clone());
        Harness {
            tmp,
            source,
            manager,
        }
    }

    #[tokio::test]
    async fn test_create_builds_rootfs_and_record() {
        let h = harness();
        let cancel = CancellationToken::new();

        let record = h.manager.create("web", BASE, &cancel).await.unwrap();
        assert_eq!(record.base_image, BASE);
        assert_eq!(record.chain_ids.len(), 2);

        let rootfs = h.tmp.path().join("store/images/web/rootfs");
        assert_eq!(std::fs::read_dir(&rootfs).unwrap().count(), 2);
        assert_eq!(h.manager.get("web").unwrap(), record);
        assert_eq!(
            h.manager.deps.dependencies(&image_owner("web")).unwrap(),
            record.chain_ids
        );
        assert!(h.manager.deps.dependencies(&base_image_owner(BASE)).is_ok());
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.manager.create("web", BASE, &cancel).await.unwrap();
        let err = h.manager.create("web", OTHER, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(h.manager.get("web").unwrap().base_image, BASE);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_image() {
        let h = harness();
        let err = h
            .manager
            .create("web", "docker.io/library/missing:1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("manifest"));
        assert!(h.manager.list().unwrap().is_empty());
        assert!(!h.tmp.path().join("store/images/web").exists());
    }

    #[tokio::test]
    async fn test_rootfs_is_independent_of_volume() {
        let h = harness();
        let cancel = CancellationToken::new();
        let record = h.manager.create("web", BASE, &cancel).await.unwrap();

        let rootfs = h.tmp.path().join("store/images/web/rootfs");
        std::fs::write(rootfs.join("scratch"), b"image only").unwrap();
        let leaf = h.manager.driver.volume_path(record.chain_ids.last().unwrap());
        assert!(!leaf.join("scratch").exists());
    }

    #[tokio::test]
    async fn test_delete_then_clean_reclaims_volumes() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.manager.create("web", BASE, &cancel).await.unwrap();
        h.manager.create("db", OTHER, &cancel).await.unwrap();

        h.manager.delete("web", &cancel).await.unwrap();
        assert!(h.manager.get("web").unwrap_err().is_not_found());
        assert!(h.manager.delete("web", &cancel).await.unwrap_err().is_not_found());

        let report = h.manager.clean(None, &[], &cancel).await.unwrap().unwrap();
        assert_eq!(report.destroyed.len(), 2);
        assert_eq!(report.retained, 1);

        let stats = h.manager.stats("db").await.unwrap();
        assert_eq!(stats.layers, 1);
    }

    #[tokio::test]
    async fn test_clean_keeps_listed_base_images() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.manager.pull(BASE, &cancel).await.unwrap();

        let report = h
            .manager
            .clean(None, &[BASE.to_string()], &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(report.destroyed.is_empty());

        let report = h.manager.clean(None, &[], &cancel).await.unwrap().unwrap();
        assert_eq!(report.destroyed.len(), 2);
    }

    #[tokio::test]
    async fn test_clean_below_threshold_is_skipped() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.manager.pull(OTHER, &cancel).await.unwrap();

        let skipped = h.manager.clean(Some(1 << 30), &[], &cancel).await.unwrap();
        assert!(skipped.is_none());
        assert!(h.manager.volume_usage().await.unwrap() > 0);

        let report = h.manager.clean(Some(0), &[], &cancel).await.unwrap().unwrap();
        assert_eq!(report.destroyed.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_base_reuses_volumes() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.manager.create("a", BASE, &cancel).await.unwrap();
        h.manager.create("b", BASE, &cancel).await.unwrap();
        assert_eq!(h.source.fetches(), 2);
        assert_eq!(h.manager.list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clean_waits_for_global_lock() {
        let h = harness();
        let cancel = CancellationToken::new();
        let _held = h
            .manager
            .locks
            .lock(GLOBAL_LOCK, &cancel)
            .await
            .unwrap();

        let err = h.manager.clean(None, &[], &cancel).await.unwrap_err();
        assert!(matches!(err, RootfsError::TimeoutError(_)));
    }

    #[tokio::test]
    async fn test_clean_recovers_from_damaged_dependency_record() {
        let h = harness();
        let cancel = CancellationToken::new();
        let record = h.manager.create("web", BASE, &cancel).await.unwrap();
        h.manager.pull(OTHER, &cancel).await.unwrap();

        let path = h.manager.deps.record_path(&image_owner("web"));
        std::fs::write(&path, b"[\"sha256:trunc").unwrap();

        for _ in 0..3 {
            let report = h.manager.clean(None, &[], &cancel).await.unwrap().unwrap();
            assert_eq!(report.retained, 2);
        }
        assert_eq!(
            h.manager.deps.dependencies(&image_owner("web")).unwrap(),
            record.chain_ids
        );
        for chain_id in &record.chain_ids {
            assert!(h.manager.driver.volume_path(chain_id).is_dir());
        }

        std::fs::remove_file(&path).unwrap();
        let report = h.manager.clean(None, &[], &cancel).await.unwrap().unwrap();
        assert!(report.destroyed.is_empty());
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn test_clean_fails_when_image_record_is_unreadable_too() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.manager.create("web", BASE, &cancel).await.unwrap();

        std::fs::remove_file(h.manager.deps.record_path(&image_owner("web"))).unwrap();
        std::fs::write(h.manager.images.record_path("web"), b"{").unwrap();

        let err = h.manager.clean(None, &[], &cancel).await.unwrap_err();
        assert!(err.is_corrupted(), "unexpected {:?}", err);
        assert_eq!(h.manager.store_usage().await.unwrap().volumes, 2);
    }

    #[tokio::test]
    async fn test_store_usage() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.manager.create("web", BASE, &cancel).await.unwrap();
        h.manager.pull(OTHER, &cancel).await.unwrap();
        h.manager
            .driver
            .create_volume(None, &crate::puller::incomplete_volume_id("sha256:x"))
            .await
            .unwrap();

        let usage = h.manager.store_usage().await.unwrap();
        assert_eq!(usage.images, 1);
        assert_eq!(usage.volumes, 4);
        assert_eq!(usage.incomplete_volumes, 1);
        assert_eq!(usage.cached_blobs, 3);
        assert!(usage.cache_bytes > 0);
        assert!(usage.volume_bytes > 0);
        // image:web, baseimage:base and baseimage:other
        assert_eq!(usage.dependency_owners, 3);

        let report = h.manager.clean(None, &[], &cancel).await.unwrap().unwrap();
        assert_eq!(report.destroyed.len(), 2);
        let usage = h.manager.store_usage().await.unwrap();
        assert_eq!(usage.incomplete_volumes, 0);
        assert_eq!(usage.cached_blobs, 0);
    }

    #[test]
    fn test_validate_image_id() {
        assert!(validate_image_id("web-1.2_x").is_ok());
        for bad in ["", ".", "..", ".hidden", "a/b", "a b"] {
            assert!(validate_image_id(bad).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_list_skips_corrupted_records() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        std::fs::create_dir_all(store.image_dir("bad")).unwrap();
        std::fs::write(store.record_path("bad"), b"{").unwrap();
        std::fs::create_dir_all(store.image_dir("partial")).unwrap();

        assert_eq!(store.ids().unwrap(), vec!["bad"]);
        assert!(store.list().unwrap().is_empty());
        assert!(store.read("bad").unwrap_err().is_corrupted());
    }
}
