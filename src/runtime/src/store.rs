//! On-disk layout of a rootfs store.

use std::path::{Path, PathBuf};

use a3s_rootfs_core::error::{Result, RootfsError};

/// Directory layout under the store root.
///
/// ```text
/// <root>/
///   volumes/             one volume per chain ID
///   images/<id>/         rootfs snapshot and image.json
///   cache/blobs/         cached layer blobs
///   meta/dependencies/   dependency records
///   locks/               flock files
///   tmp/
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("cache").join("blobs")
    }

    pub fn dependencies_dir(&self) -> PathBuf {
        self.root.join("meta").join("dependencies")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Create every directory of the layout.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.volumes_dir(),
            self.images_dir(),
            self.blobs_dir(),
            self.dependencies_dir(),
            self.locks_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                RootfsError::Other(format!(
                    "Failed to create store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        tracing::debug!(root = %self.root.display(), "Store layout ready");
        Ok(())
    }
}
