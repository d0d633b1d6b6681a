//! Unpack child entry point.
//!
//! The re-executed child reads one byte from its control descriptor, then
//! spools the tar stream on stdin, hides the lower-layer entries the layer
//! whites out and extracts it into the target directory. EOF on the control
//! descriptor means the parent gave up; the child then exits without
//! touching the target.

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use a3s_rootfs_core::error::{Result, RootfsError};
use tempfile::NamedTempFile;

use super::gate::{wait_for_gate, GateSignal};
use crate::fs::is_real_dir;
use crate::idmap::combined_output;

/// Prefix of an OCI whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker making a directory opaque to lower layers.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// How the child finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Extracted,
    Aborted,
}

/// Extracts an archive file into a directory.
pub trait Extractor {
    fn extract(&self, archive: &Path, target: &Path) -> Result<()>;
}

/// Runs the system `tar`, preserving permissions and numeric ownership.
#[derive(Debug, Clone)]
pub struct TarExtractor {
    tar: PathBuf,
}

impl TarExtractor {
    pub fn new(tar: impl Into<PathBuf>) -> Self {
        Self { tar: tar.into() }
    }

    fn args(archive: &Path, target: &Path) -> Vec<String> {
        vec![
            "-x".to_string(),
            "-p".to_string(),
            "--numeric-owner".to_string(),
            "-f".to_string(),
            archive.display().to_string(),
            "-C".to_string(),
            target.display().to_string(),
        ]
    }
}

impl Extractor for TarExtractor {
    fn extract(&self, archive: &Path, target: &Path) -> Result<()> {
        let output = Command::new(&self.tar)
            .args(Self::args(archive, target))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RootfsError::ExternalTool {
                tool: self.tar.display().to_string(),
                status: "spawn failed".to_string(),
                output: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(RootfsError::ExternalTool {
                tool: self.tar.display().to_string(),
                status: output.status.to_string(),
                output: combined_output(&output.stdout, &output.stderr),
            });
        }
        Ok(())
    }
}

/// Child side of the unpack protocol.
///
/// Waits on `control`, then unpacks the tar stream read from `layer` into
/// `target` with OCI whiteout semantics.
pub fn run_unpack_child<R: Read + ?Sized>(
    control: &mut R,
    layer: &mut dyn Read,
    target: &Path,
    extractor: &dyn Extractor,
) -> Result<ChildOutcome> {
    let signal = wait_for_gate(control).map_err(|e| {
        RootfsError::UnpackError(format!("Failed to read control descriptor: {}", e))
    })?;

    if signal == GateSignal::Aborted {
        return Ok(ChildOutcome::Aborted);
    }

    let spooled = spool(layer)?;
    let archive = spooled.reopen().map_err(|e| {
        RootfsError::UnpackError(format!("Failed to reopen spooled layer: {}", e))
    })?;
    let whiteouts = Whiteouts::scan(archive)?;

    whiteouts.hide_lower_entries(target)?;
    extractor.extract(spooled.path(), target)?;
    whiteouts.remove_markers(target)?;
    Ok(ChildOutcome::Extracted)
}

fn spool(layer: &mut dyn Read) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()
        .map_err(|e| RootfsError::UnpackError(format!("Failed to create spool file: {}", e)))?;
    std::io::copy(layer, &mut file)
        .and_then(|_| file.flush())
        .map_err(|e| RootfsError::UnpackError(format!("Failed to read layer stream: {}", e)))?;
    Ok(file)
}

/// Whiteout entries of one layer archive, as paths relative to the rootfs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Whiteouts {
    /// Directories whose lower-layer contents are hidden
    pub opaque_dirs: Vec<PathBuf>,
    /// Lower-layer paths the layer deletes
    pub hidden: Vec<PathBuf>,
    /// The marker entries themselves, never part of the result
    pub markers: Vec<PathBuf>,
}

impl Whiteouts {
    /// Collect the whiteouts of a tar stream.
    ///
    /// Entry paths climbing out of the rootfs and whiteouts naming `.`, `..`
    /// or nothing are rejected.
    pub fn scan<R: Read>(layer: R) -> Result<Self> {
        let scan_error =
            |e: std::io::Error| RootfsError::UnpackError(format!("Failed to read layer archive: {}", e));

        let mut archive = tar::Archive::new(layer);
        let mut whiteouts = Self::default();
        for entry in archive.entries().map_err(scan_error)? {
            let entry = entry.map_err(scan_error)?;
            let path = rootfs_relative(&entry.path().map_err(scan_error)?)?;
            let Some(name) = path.file_name() else {
                continue;
            };
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

            if name == OPAQUE_WHITEOUT {
                whiteouts.opaque_dirs.push(parent);
            } else if let Some(hidden) = name.as_bytes().strip_prefix(WHITEOUT_PREFIX.as_bytes()) {
                if hidden.is_empty() || hidden == b"." || hidden == b".." {
                    return Err(RootfsError::UnpackError(format!(
                        "Invalid whiteout entry {}",
                        path.display()
                    )));
                }
                whiteouts.hidden.push(parent.join(OsStr::from_bytes(hidden)));
            } else {
                continue;
            }
            whiteouts.markers.push(path);
        }
        Ok(whiteouts)
    }

    /// Empty opaque directories and delete whited-out paths in `root`,
    /// which still holds only the lower layers.
    pub fn hide_lower_entries(&self, root: &Path) -> Result<()> {
        for dir in &self.opaque_dirs {
            let Some(dir) = resolve_beneath(root, dir) else {
                continue;
            };
            if !is_real_dir(&dir) {
                continue;
            }
            let entries = std::fs::read_dir(&dir).map_err(|e| {
                RootfsError::UnpackError(format!("Failed to read {}: {}", dir.display(), e))
            })?;
            for entry in entries {
                remove_path(&entry?.path())?;
            }
        }

        for hidden in &self.hidden {
            if let Some(path) = resolve_beneath(root, hidden) {
                remove_path(&path)?;
            }
        }
        Ok(())
    }

    /// Delete the marker files the extraction left behind.
    pub fn remove_markers(&self, root: &Path) -> Result<()> {
        for marker in &self.markers {
            if let Some(path) = resolve_beneath(root, marker) {
                remove_path(&path)?;
            }
        }
        Ok(())
    }
}

/// Normalize an archive entry path. `./` and leading `/` are dropped.
fn rootfs_relative(path: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(RootfsError::UnpackError(format!(
                    "Layer entry {} points outside the rootfs",
                    path.display()
                )))
            }
        }
    }
    Ok(relative)
}

/// `root/relative` when every directory on the way is a real directory.
/// A symlinked or missing ancestor yields `None`.
fn resolve_beneath(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_some() {
            current.push(component);
            if !is_real_dir(&current) {
                return None;
            }
        } else {
            current.push(component);
        }
    }
    Some(current)
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RootfsError::UnpackError(format!(
            "Failed to apply whiteout {}: {}",
            path.display(),
            e
        ))),
    }
}
