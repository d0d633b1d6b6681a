//! Namespaced layer unpacking.
//!
//! A layer is extracted by a re-executed copy of the binary. The child is
//! started in a new user namespace when ID mappings are requested, and waits
//! on a control pipe (fd 3) until the parent has written its UID/GID maps.
//! Only then does the parent release it and stream the decompressed tar
//! into its stdin.

pub mod child;
pub mod gate;

pub use child::{run_unpack_child, ChildOutcome, Extractor, TarExtractor, Whiteouts};
pub use gate::{wait_for_gate, ControlPipe, Gate, GateSignal};

use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use a3s_rootfs_core::config::IdMappingSpec;
use a3s_rootfs_core::error::{Result, RootfsError};
use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sched::{unshare, CloneFlags};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::compression::decompressed;
use crate::idmap::{combined_output, IdMapper};

/// Descriptor number the child reads the control pipe from.
pub const CONTROL_FD: i32 = 3;

/// Subcommand that dispatches to the unpack child entry point.
pub const UNPACK_COMMAND: &str = "unpack";

const FEED_BUFFER_SIZE: usize = 64 * 1024;

/// One layer extraction request.
#[derive(Debug, Clone)]
pub struct UnpackSpec {
    /// Cached (possibly compressed) layer blob
    pub blob_path: PathBuf,
    /// Directory the layer is extracted into
    pub target: PathBuf,
    pub uid_mappings: Vec<IdMappingSpec>,
    pub gid_mappings: Vec<IdMappingSpec>,
}

impl UnpackSpec {
    pub fn needs_user_namespace(&self) -> bool {
        !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty()
    }
}

/// Extracts a layer blob into a directory.
#[async_trait]
pub trait LayerUnpacker: Send + Sync {
    async fn unpack(&self, spec: &UnpackSpec, cancel: &CancellationToken) -> Result<()>;
}

/// Program and leading arguments that start the unpack child.
///
/// The target directory is appended as the last argument.
#[derive(Debug, Clone)]
pub struct ReexecCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ReexecCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the running binary with the unpack subcommand.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| {
            RootfsError::UnpackError(format!("Failed to locate current executable: {}", e))
        })?;
        Ok(Self::new(program, vec![OsString::from(UNPACK_COMMAND)]))
    }
}

/// [`LayerUnpacker`] that runs extraction in a gated child process.
pub struct NamespacedUnpacker {
    reexec: ReexecCommand,
    mapper: Arc<dyn IdMapper>,
}

impl NamespacedUnpacker {
    pub fn new(reexec: ReexecCommand, mapper: Arc<dyn IdMapper>) -> Self {
        Self { reexec, mapper }
    }

    async fn apply_mappings(&self, pid: u32, spec: &UnpackSpec) -> Result<()> {
        if !spec.uid_mappings.is_empty() {
            self.mapper.map_uids(pid, &spec.uid_mappings).await?;
        }
        if !spec.gid_mappings.is_empty() {
            self.mapper.map_gids(pid, &spec.gid_mappings).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LayerUnpacker for NamespacedUnpacker {
    async fn unpack(&self, spec: &UnpackSpec, cancel: &CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&spec.target).map_err(|e| {
            RootfsError::UnpackError(format!(
                "Failed to create target directory {}: {}",
                spec.target.display(),
                e
            ))
        })?;

        // Fail on a missing blob before spawning anything
        let blob = File::open(&spec.blob_path).map_err(|e| {
            RootfsError::UnpackError(format!(
                "Failed to open layer blob {}: {}",
                spec.blob_path.display(),
                e
            ))
        })?;

        let (control_reader, gate) = ControlPipe::new()?.into_parts();
        let (stdin_reader, stdin_writer) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| RootfsError::UnpackError(format!("Failed to create stdin pipe: {}", e)))?;

        let user_namespace = spec.needs_user_namespace();
        let control_fd = control_reader.as_raw_fd();

        let mut cmd = Command::new(&self.reexec.program);
        cmd.args(&self.reexec.args)
            .arg(&spec.target)
            .stdin(Stdio::from(stdin_reader))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe syscalls run between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                if user_namespace {
                    unshare(CloneFlags::CLONE_NEWUSER)?;
                }
                if control_fd != CONTROL_FD {
                    nix::unistd::dup2(control_fd, CONTROL_FD)?;
                }
                fcntl(CONTROL_FD, FcntlArg::F_SETFD(FdFlag::empty()))?;
                Ok(())
            });
        }

        let spawned = cmd.spawn();
        // Release the child's pipe ends held by the command
        drop(cmd);
        drop(control_reader);

        let child = spawned.map_err(|e| RootfsError::ExternalTool {
            tool: self.reexec.program.display().to_string(),
            status: "spawn failed".to_string(),
            output: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| {
            RootfsError::UnpackError("Unpack child exited before its pid was read".to_string())
        })?;

        tracing::debug!(
            pid,
            target = %spec.target.display(),
            user_namespace,
            "Spawned unpack child"
        );

        if let Err(e) = self.apply_mappings(pid, spec).await {
            gate.abort();
            drop(stdin_writer);
            // The child sees EOF on its control descriptor and should exit 0
            if let Some(problem) = reap_aborted_child(child).await {
                tracing::warn!(pid, problem = %problem, "Unpack child did not exit cleanly after abort");
            }
            return Err(RootfsError::IdMapping {
                pid,
                source: Box::new(e),
            });
        }

        gate.open()?;

        let blob_path = spec.blob_path.clone();
        let feeder = tokio::task::spawn_blocking(move || {
            feed_layer(&blob_path, blob, File::from(stdin_writer))
        });

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                RootfsError::UnpackError(format!("Failed to wait for unpack child {}: {}", pid, e))
            })?,
            _ = cancel.cancelled() => {
                return Err(RootfsError::Cancelled(format!(
                    "unpacking into {}",
                    spec.target.display()
                )));
            }
        };

        let fed = feeder
            .await
            .map_err(|e| RootfsError::UnpackError(format!("Layer feeder task failed: {}", e)))?;

        // Decompression failures explain whatever the child reported
        fed?;

        if !output.status.success() {
            return Err(RootfsError::ExternalTool {
                tool: format!("{} {}", self.reexec.program.display(), UNPACK_COMMAND),
                status: output.status.to_string(),
                output: combined_output(&output.stdout, &output.stderr),
            });
        }

        tracing::debug!(
            pid,
            blob = %spec.blob_path.display(),
            target = %spec.target.display(),
            "Unpacked layer"
        );
        Ok(())
    }
}

/// Wait for a child whose gate was aborted. `None` means it exited 0;
/// otherwise the exit status and output are described.
async fn reap_aborted_child(child: tokio::process::Child) -> Option<String> {
    match child.wait_with_output().await {
        Ok(output) if output.status.success() => None,
        Ok(output) => Some(format!(
            "{}: {}",
            output.status,
            combined_output(&output.stdout, &output.stderr)
        )),
        Err(e) => Some(format!("wait failed: {}", e)),
    }
}

/// Stream the decompressed blob into the child's stdin.
///
/// A child that stops reading (broken pipe) is not an error here; its exit
/// status reports the problem.
fn feed_layer(blob_path: &Path, blob: File, mut stdin: File) -> Result<()> {
    let corrupted = |e: std::io::Error| RootfsError::Corrupted {
        what: format!("layer blob {}", blob_path.display()),
        message: e.to_string(),
    };

    let mut reader = decompressed(blob).map_err(corrupted)?;
    let mut buf = vec![0u8; FEED_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(corrupted(e)),
        };
        match stdin.write_all(&buf[..n]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => {
                return Err(RootfsError::UnpackError(format!(
                    "Failed to stream layer into unpack child: {}",
                    e
                )))
            }
        }
    }
}
