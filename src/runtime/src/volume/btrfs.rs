//! btrfs subvolume driver.
//!
//! Volumes and image rootfs trees are subvolumes; a child layer is a
//! writable snapshot of its parent.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use a3s_rootfs_core::error::{Result, RootfsError};
use async_trait::async_trait;
use tokio::process::Command;

use super::{rename_volume, VolumeDriver};
use crate::fs::is_real_dir;
use crate::idmap::combined_output;

/// Volume driver backed by `btrfs subvolume` commands.
#[derive(Debug, Clone)]
pub struct BtrfsDriver {
    volumes_dir: PathBuf,
    btrfs: PathBuf,
}

impl BtrfsDriver {
    pub fn new(volumes_dir: &Path, btrfs: PathBuf) -> Self {
        Self {
            volumes_dir: volumes_dir.to_path_buf(),
            btrfs,
        }
    }

    async fn subvolume(&self, args: &[&OsStr]) -> Result<()> {
        let output = Command::new(&self.btrfs)
            .arg("subvolume")
            .args(args)
            .output()
            .await
            .map_err(|e| RootfsError::ExternalTool {
                tool: self.btrfs.display().to_string(),
                status: "spawn failed".to_string(),
                output: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(RootfsError::ExternalTool {
                tool: format!("{} subvolume", self.btrfs.display()),
                status: output.status.to_string(),
                output: combined_output(&output.stdout, &output.stderr),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeDriver for BtrfsDriver {
    fn volumes_dir(&self) -> &Path {
        &self.volumes_dir
    }

    async fn create_volume(&self, parent_id: Option<&str>, id: &str) -> Result<PathBuf> {
        let path = self.volume_path(id);
        if path.exists() {
            return Err(RootfsError::VolumeError(format!("Volume {} already exists", id)));
        }

        match parent_id {
            None => self.subvolume(&[OsStr::new("create"), path.as_os_str()]).await?,
            Some(parent) => {
                let parent_path = self.volume_path(parent);
                if !is_real_dir(&parent_path) {
                    return Err(RootfsError::not_found("volume", parent));
                }
                self.subvolume(&[OsStr::new("snapshot"), parent_path.as_os_str(), path.as_os_str()])
                    .await?
            }
        }

        tracing::debug!(id = %id, parent = ?parent_id, "Created btrfs volume");
        Ok(path)
    }

    async fn snapshot(&self, from: &Path, to: &Path) -> Result<()> {
        if !is_real_dir(from) {
            return Err(RootfsError::not_found("snapshot source", from.display().to_string()));
        }
        self.subvolume(&[OsStr::new("snapshot"), from.as_os_str(), to.as_os_str()])
            .await
    }

    async fn destroy_volume(&self, id: &str) -> Result<()> {
        let path = self.volume_path(id);
        if !is_real_dir(&path) {
            return Err(RootfsError::not_found("volume", id));
        }
        self.subvolume(&[OsStr::new("delete"), path.as_os_str()]).await?;
        tracing::debug!(id = %id, "Destroyed btrfs volume");
        Ok(())
    }

    async fn destroy_snapshot(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        self.subvolume(&[OsStr::new("delete"), path.as_os_str()]).await
    }

    async fn move_volume(&self, from_id: &str, to_id: &str) -> Result<()> {
        rename_volume(self, from_id, to_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_invokes_btrfs() {
        let tmp = TempDir::new().unwrap();
        let driver = BtrfsDriver::new(tmp.path(), PathBuf::from("true"));
        let path = driver.create_volume(None, "sha256:root").await.unwrap();
        assert_eq!(path, tmp.path().join("root"));
    }

    #[tokio::test]
    async fn test_tool_failure_surfaces_as_external_tool() {
        let tmp = TempDir::new().unwrap();
        let driver = BtrfsDriver::new(tmp.path(), PathBuf::from("false"));
        let err = driver.create_volume(None, "sha256:root").await.unwrap_err();
        match err {
            RootfsError::ExternalTool { tool, .. } => assert_eq!(tool, "false subvolume"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_requires_parent_volume() {
        let tmp = TempDir::new().unwrap();
        let driver = BtrfsDriver::new(tmp.path(), PathBuf::from("true"));
        let err = driver
            .create_volume(Some("sha256:missing"), "sha256:child")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_destroy_missing_volume() {
        let tmp = TempDir::new().unwrap();
        let driver = BtrfsDriver::new(tmp.path(), PathBuf::from("true"));
        assert!(driver
            .destroy_volume("sha256:missing")
            .await
            .unwrap_err()
            .is_not_found());
        driver
            .destroy_snapshot(&tmp.path().join("nothing"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let tmp = TempDir::new().unwrap();
        let driver = BtrfsDriver::new(tmp.path(), PathBuf::from("/nonexistent/btrfs"));
        let err = driver.create_volume(None, "sha256:root").await.unwrap_err();
        assert!(matches!(err, RootfsError::ExternalTool { .. }));
    }
}
