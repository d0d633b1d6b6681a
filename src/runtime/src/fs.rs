//! Filesystem helpers for directory-backed volumes and image rootfs trees.

use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use a3s_rootfs_core::error::{Result, RootfsError};
use nix::sys::stat::{mknod, Mode, SFlag};

/// Copy a directory tree, preserving symlinks, modes, ownership and
/// device/fifo nodes. Ownership is kept where the caller is allowed to set it.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let dir_meta = std::fs::symlink_metadata(src).map_err(|e| copy_error(src, dst, e))?;
    std::fs::create_dir_all(dst).map_err(|e| copy_error(src, dst, e))?;

    for entry in std::fs::read_dir(src).map_err(|e| copy_error(src, dst, e))? {
        let entry = entry.map_err(|e| copy_error(src, dst, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&src_path).map_err(|e| copy_error(&src_path, &dst_path, e))?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
            continue;
        }

        if file_type.is_symlink() {
            let link = std::fs::read_link(&src_path).map_err(|e| copy_error(&src_path, &dst_path, e))?;
            std::os::unix::fs::symlink(&link, &dst_path).map_err(|e| copy_error(&src_path, &dst_path, e))?;
        } else if file_type.is_file() {
            std::fs::copy(&src_path, &dst_path).map_err(|e| copy_error(&src_path, &dst_path, e))?;
        } else if file_type.is_fifo() || file_type.is_char_device() || file_type.is_block_device() {
            let kind = if file_type.is_fifo() {
                SFlag::S_IFIFO
            } else if file_type.is_char_device() {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            mknod(
                &dst_path,
                kind,
                Mode::from_bits_truncate(meta.mode() & 0o7777),
                meta.rdev(),
            )
            .map_err(|e| copy_error(&src_path, &dst_path, e.into()))?;
        } else {
            // Sockets are not meaningful in a rootfs snapshot
            tracing::debug!(path = %src_path.display(), "Skipping socket during copy");
            continue;
        }

        copy_metadata(&dst_path, &meta)?;
    }

    // Last, so a read-only source directory does not block its own children
    copy_metadata(dst, &dir_meta)
}

fn copy_metadata(dst: &Path, meta: &std::fs::Metadata) -> Result<()> {
    match std::os::unix::fs::lchown(dst, Some(meta.uid()), Some(meta.gid())) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            tracing::trace!(path = %dst.display(), "Cannot preserve ownership");
        }
        Err(e) => {
            return Err(RootfsError::VolumeError(format!(
                "Failed to set ownership of {}: {}",
                dst.display(),
                e
            )))
        }
    }

    // Symlink modes are fixed; chmod would follow the link
    if !meta.file_type().is_symlink() {
        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|e| {
                RootfsError::VolumeError(format!(
                    "Failed to set permissions of {}: {}",
                    dst.display(),
                    e
                ))
            })?;
    }
    Ok(())
}

fn copy_error(src: &Path, dst: &Path, e: std::io::Error) -> RootfsError {
    RootfsError::VolumeError(format!(
        "Failed to copy {} to {}: {}",
        src.display(),
        dst.display(),
        e
    ))
}

/// Apparent size of a directory tree in bytes. Symlinks are not followed.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(meta) = std::fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.is_dir() {
                total += dir_size(&entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}

/// Remove a file or directory tree. Missing paths are not an error.
pub fn remove_tree(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            make_writable(path);
            std::fs::remove_dir_all(path)
        }
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Grant the owner write access to every directory so a tree extracted
/// with restrictive modes (e.g. 0555 `/proc` placeholders) can be removed.
fn make_writable(dir: &Path) {
    if let Ok(meta) = std::fs::symlink_metadata(dir) {
        let mode = meta.mode();
        if meta.is_dir() && mode & 0o200 == 0 {
            let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode((mode & 0o7777) | 0o700));
        }
    }
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                make_writable(&entry.path());
            }
        }
    }
}

/// Whether `path` exists and is a directory, without following a final symlink.
pub fn is_real_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
