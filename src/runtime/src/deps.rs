//! Dependency records: which volumes each image or base image needs.
//!
//! One JSON file per owner key holds the ordered chain IDs it depends on.
//! The garbage collector treats every listed volume as live.

use std::path::{Path, PathBuf};

use a3s_rootfs_core::error::{Result, RootfsError};

/// Owner key prefix for images created from a base image.
pub const IMAGE_OWNER_PREFIX: &str = "image:";

/// Owner key prefix for pulled base images.
pub const BASE_IMAGE_OWNER_PREFIX: &str = "baseimage:";

/// Owner key of an image.
pub fn image_owner(image_id: &str) -> String {
    format!("{}{}", IMAGE_OWNER_PREFIX, image_id)
}

/// Owner key of a base image reference.
pub fn base_image_owner(reference: &str) -> String {
    format!("{}{}", BASE_IMAGE_OWNER_PREFIX, reference)
}

/// Persists dependency records under one directory.
///
/// No locking happens here; callers serialize register-and-use themselves.
#[derive(Debug, Clone)]
pub struct DependencyManager {
    dir: PathBuf,
}

impl DependencyManager {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            RootfsError::Other(format!(
                "Failed to create dependency directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Record `chain_ids` for `owner`, replacing any previous record.
    pub fn register(&self, owner: &str, chain_ids: &[String]) -> Result<()> {
        let path = self.record_path(owner);
        let json = serde_json::to_vec(chain_ids)?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| {
            RootfsError::Other(format!(
                "Failed to write dependency record {}: {}",
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
        })?;

        tracing::debug!(owner = %owner, volumes = chain_ids.len(), "Registered dependencies");
        Ok(())
    }

    /// Remove `owner`'s record. Missing records are fine.
    pub fn deregister(&self, owner: &str) -> Result<()> {
        let path = self.record_path(owner);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(owner = %owner, "Deregistered dependencies");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RootfsError::Other(format!(
                "Failed to remove dependency record {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Chain IDs recorded for `owner`.
    ///
    /// A never-registered owner is [`RootfsError::NotFound`]. A record that
    /// does not parse is deleted and reported as corrupted.
    pub fn dependencies(&self, owner: &str) -> Result<Vec<String>> {
        let path = self.record_path(owner);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RootfsError::not_found("dependency record", owner))
            }
            Err(e) => {
                return Err(RootfsError::Other(format!(
                    "Failed to read dependency record {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        serde_json::from_slice(&data).map_err(|e| {
            tracing::warn!(owner = %owner, error = %e, "Removing malformed dependency record");
            let _ = std::fs::remove_file(&path);
            RootfsError::Corrupted {
                what: format!("dependency record {}", owner),
                message: e.to_string(),
            }
        })
    }

    /// Owners with a record, sorted.
    pub fn owners(&self) -> Result<Vec<String>> {
        let mut owners = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                owners.push(stem.replace("__", "/"));
            }
        }
        owners.sort();
        Ok(owners)
    }

    /// File holding `owner`'s record.
    pub fn record_path(&self, owner: &str) -> PathBuf {
        self.dir.join(format!("{}.json", owner.replace('/', "__")))
    }
}
