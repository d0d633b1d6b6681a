//! Copy-on-write layer volumes.
//!
//! Every layer volume is named by its chain ID and lives under the store's
//! `volumes/` directory. A root layer starts as an empty volume; any other
//! layer starts as a snapshot of its parent. The backing implementation is
//! picked once from configuration.

mod btrfs;
mod directory;

pub use btrfs::BtrfsDriver;
pub use directory::DirectoryDriver;

use std::path::{Path, PathBuf};

use a3s_rootfs_core::config::{DriverKind, ToolsConfig};
use a3s_rootfs_core::error::{Result, RootfsError};
use async_trait::async_trait;

use crate::digest::{id_to_name, name_to_id};
use crate::fs::{dir_size, is_real_dir};

/// Operations the store needs from a backing filesystem.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Directory holding all volumes.
    fn volumes_dir(&self) -> &Path;

    /// Where the volume for `id` lives, whether or not it exists.
    fn volume_path(&self, id: &str) -> PathBuf {
        self.volumes_dir().join(id_to_name(id))
    }

    fn volume_exists(&self, id: &str) -> bool {
        is_real_dir(&self.volume_path(id))
    }

    /// Create volume `id`, empty or as a snapshot of `parent_id`.
    async fn create_volume(&self, parent_id: Option<&str>, id: &str) -> Result<PathBuf>;

    /// Snapshot an arbitrary tree (a volume or image rootfs) to `to`.
    async fn snapshot(&self, from: &Path, to: &Path) -> Result<()>;

    async fn destroy_volume(&self, id: &str) -> Result<()>;

    /// Remove a tree created by [`VolumeDriver::snapshot`].
    async fn destroy_snapshot(&self, path: &Path) -> Result<()>;

    /// Rename a volume. Fails if `to_id` already exists.
    async fn move_volume(&self, from_id: &str, to_id: &str) -> Result<()>;

    /// Ids of every volume on disk, sorted.
    async fn volumes(&self) -> Result<Vec<String>> {
        let dir = self.volumes_dir();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RootfsError::VolumeError(format!(
                    "Failed to list volumes in {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                RootfsError::VolumeError(format!("Failed to read volume entry: {}", e))
            })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                ids.push(name_to_id(&entry.file_name().to_string_lossy()));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Apparent bytes used by all volumes.
    async fn usage(&self) -> Result<u64> {
        let dir = self.volumes_dir().to_path_buf();
        tokio::task::spawn_blocking(move || dir_size(&dir))
            .await
            .map_err(|e| RootfsError::VolumeError(format!("Usage scan failed: {}", e)))
    }
}

/// The configured volume driver.
pub enum Driver {
    Btrfs(BtrfsDriver),
    Directory(DirectoryDriver),
}

impl Driver {
    /// Build the driver for `kind`, creating `volumes_dir` if needed.
    pub fn new(kind: DriverKind, volumes_dir: &Path, tools: &ToolsConfig) -> Result<Self> {
        std::fs::create_dir_all(volumes_dir).map_err(|e| {
            RootfsError::VolumeError(format!(
                "Failed to create volumes directory {}: {}",
                volumes_dir.display(),
                e
            ))
        })?;

        let driver = match kind {
            DriverKind::Btrfs => Driver::Btrfs(BtrfsDriver::new(volumes_dir, tools.btrfs.clone())),
            DriverKind::Dir => Driver::Directory(DirectoryDriver::new(volumes_dir)),
        };
        tracing::debug!(driver = %kind, dir = %volumes_dir.display(), "Volume driver ready");
        Ok(driver)
    }

    fn inner(&self) -> &dyn VolumeDriver {
        match self {
            Driver::Btrfs(d) => d as &dyn VolumeDriver,
            Driver::Directory(d) => d,
        }
    }
}

#[async_trait]
impl VolumeDriver for Driver {
    fn volumes_dir(&self) -> &Path {
        self.inner().volumes_dir()
    }

    async fn create_volume(&self, parent_id: Option<&str>, id: &str) -> Result<PathBuf> {
        self.inner().create_volume(parent_id, id).await
    }

    async fn snapshot(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner().snapshot(from, to).await
    }

    async fn destroy_volume(&self, id: &str) -> Result<()> {
        self.inner().destroy_volume(id).await
    }

    async fn destroy_snapshot(&self, path: &Path) -> Result<()> {
        self.inner().destroy_snapshot(path).await
    }

    async fn move_volume(&self, from_id: &str, to_id: &str) -> Result<()> {
        self.inner().move_volume(from_id, to_id).await
    }
}

/// Rename `from_id`'s directory to `to_id`'s. Shared by both drivers.
pub(crate) fn rename_volume(driver: &dyn VolumeDriver, from_id: &str, to_id: &str) -> Result<()> {
    let from = driver.volume_path(from_id);
    let to = driver.volume_path(to_id);

    if !is_real_dir(&from) {
        return Err(RootfsError::not_found("volume", from_id));
    }
    if to.exists() {
        return Err(RootfsError::VolumeError(format!(
            "Volume {} already exists",
            to_id
        )));
    }

    std::fs::rename(&from, &to).map_err(|e| {
        RootfsError::VolumeError(format!(
            "Failed to move volume {} to {}: {}",
            from_id, to_id, e
        ))
    })
}
