//! Plain-directory volumes. Snapshots are full recursive copies.

use std::path::{Path, PathBuf};

use a3s_rootfs_core::error::{Result, RootfsError};
use async_trait::async_trait;

use super::{rename_volume, VolumeDriver};
use crate::fs::{copy_tree, is_real_dir, remove_tree};

/// Volume driver for filesystems without native snapshots.
#[derive(Debug, Clone)]
pub struct DirectoryDriver {
    volumes_dir: PathBuf,
}

impl DirectoryDriver {
    pub fn new(volumes_dir: &Path) -> Self {
        Self {
            volumes_dir: volumes_dir.to_path_buf(),
        }
    }

    async fn copy(from: PathBuf, to: PathBuf) -> Result<()> {
        tokio::task::spawn_blocking(move || {
            let result = copy_tree(&from, &to);
            if result.is_err() {
                // Leave nothing half-copied behind
                let _ = remove_tree(&to);
            }
            result
        })
        .await
        .map_err(|e| RootfsError::VolumeError(format!("Copy task failed: {}", e)))?
    }

    async fn remove(path: PathBuf) -> Result<()> {
        tokio::task::spawn_blocking(move || {
            remove_tree(&path).map_err(|e| {
                RootfsError::VolumeError(format!("Failed to remove {}: {}", path.display(), e))
            })
        })
        .await
        .map_err(|e| RootfsError::VolumeError(format!("Remove task failed: {}", e)))?
    }
}

#[async_trait]
impl VolumeDriver for DirectoryDriver {
    fn volumes_dir(&self) -> &Path {
        &self.volumes_dir
    }

    async fn create_volume(&self, parent_id: Option<&str>, id: &str) -> Result<PathBuf> {
        let path = self.volume_path(id);
        if path.exists() {
            return Err(RootfsError::VolumeError(format!("Volume {} already exists", id)));
        }

        match parent_id {
            None => std::fs::create_dir(&path).map_err(|e| {
                RootfsError::VolumeError(format!(
                    "Failed to create volume {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Some(parent) => {
                let parent_path = self.volume_path(parent);
                if !is_real_dir(&parent_path) {
                    return Err(RootfsError::not_found("volume", parent));
                }
                Self::copy(parent_path, path.clone()).await?;
            }
        }

        tracing::debug!(id = %id, parent = ?parent_id, "Created directory volume");
        Ok(path)
    }

    async fn snapshot(&self, from: &Path, to: &Path) -> Result<()> {
        if !is_real_dir(from) {
            return Err(RootfsError::not_found("snapshot source", from.display().to_string()));
        }
        if to.exists() {
            return Err(RootfsError::VolumeError(format!(
                "Snapshot target {} already exists",
                to.display()
            )));
        }
        Self::copy(from.to_path_buf(), to.to_path_buf()).await
    }

    async fn destroy_volume(&self, id: &str) -> Result<()> {
        let path = self.volume_path(id);
        if !is_real_dir(&path) {
            return Err(RootfsError::not_found("volume", id));
        }
        Self::remove(path).await?;
        tracing::debug!(id = %id, "Destroyed directory volume");
        Ok(())
    }

    async fn destroy_snapshot(&self, path: &Path) -> Result<()> {
        Self::remove(path.to_path_buf()).await
    }

    async fn move_volume(&self, from_id: &str, to_id: &str) -> Result<()> {
        rename_volume(self, from_id, to_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn driver(tmp: &TempDir) -> DirectoryDriver {
        DirectoryDriver::new(tmp.path())
    }

    #[tokio::test]
    async fn test_root_volume_is_empty() {
        let tmp = TempDir::new().unwrap();
        let path = driver(&tmp).create_volume(None, "sha256:root").await.unwrap();
        assert!(path.is_dir());
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_child_volume_snapshots_parent() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);
        let parent = driver.create_volume(None, "sha256:parent").await.unwrap();
        std::fs::write(parent.join("base"), b"from parent").unwrap();

        let child = driver
            .create_volume(Some("sha256:parent"), "sha256:child")
            .await
            .unwrap();
        std::fs::write(child.join("extra"), b"child only").unwrap();

        assert_eq!(std::fs::read(child.join("base")).unwrap(), b"from parent");
        assert!(!parent.join("extra").exists());
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = driver(&tmp)
            .create_volume(Some("sha256:ghost"), "sha256:child")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_volume_rejected() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);
        driver.create_volume(None, "sha256:a").await.unwrap();
        assert!(driver.create_volume(None, "sha256:a").await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_volume() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);
        driver.create_volume(None, "sha256:a").await.unwrap();

        driver.destroy_volume("sha256:a").await.unwrap();
        assert!(!driver.volume_exists("sha256:a"));
        assert!(driver.destroy_volume("sha256:a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_move_volume() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);
        let temp_id = "sha256:abc-incomplete-1234";
        driver.create_volume(None, temp_id).await.unwrap();

        driver.move_volume(temp_id, "sha256:abc").await.unwrap();
        assert!(driver.volume_exists("sha256:abc"));
        assert!(!driver.volume_exists(temp_id));
    }

    #[tokio::test]
    async fn test_move_onto_existing_fails() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);
        driver.create_volume(None, "sha256:a").await.unwrap();
        driver.create_volume(None, "sha256:b").await.unwrap();

        assert!(driver.move_volume("sha256:a", "sha256:b").await.is_err());
        assert!(driver.volume_exists("sha256:a"));
    }

    #[tokio::test]
    async fn test_snapshot_and_destroy_snapshot() {
        let tmp = TempDir::new().unwrap();
        let driver = driver(&tmp);
        let leaf = driver.create_volume(None, "sha256:leaf").await.unwrap();
        std::fs::write(leaf.join("os-release"), b"ID=test").unwrap();

        let rootfs = tmp.path().join("images/web/rootfs");
        std::fs::create_dir_all(rootfs.parent().unwrap()).unwrap();
        driver.snapshot(&leaf, &rootfs).await.unwrap();
        assert_eq!(std::fs::read(rootfs.join("os-release")).unwrap(), b"ID=test");

        driver.destroy_snapshot(&rootfs).await.unwrap();
        assert!(!rootfs.exists());
        assert!(leaf.join("os-release").exists());
    }
}
