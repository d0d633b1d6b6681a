//! User namespace ID mapping through the host's setuid helpers.
//!
//! `newuidmap`/`newgidmap` write `/proc/<pid>/{uid,gid}_map` for a process
//! that has just entered a new user namespace. They are invoked as
//! `<tool> <pid> <nsID> <hostID> <size> [...]`, one triple per mapping.

use std::path::{Path, PathBuf};

use a3s_rootfs_core::config::{IdMappingSpec, ToolsConfig};
use a3s_rootfs_core::error::{Result, RootfsError};
use async_trait::async_trait;
use tokio::process::Command;

/// Applies ID mappings to a running process's user namespace.
#[async_trait]
pub trait IdMapper: Send + Sync {
    async fn map_uids(&self, pid: u32, mappings: &[IdMappingSpec]) -> Result<()>;

    async fn map_gids(&self, pid: u32, mappings: &[IdMappingSpec]) -> Result<()>;
}

/// [`IdMapper`] backed by external helper executables.
#[derive(Debug, Clone)]
pub struct CommandIdMapper {
    newuidmap: PathBuf,
    newgidmap: PathBuf,
}

impl CommandIdMapper {
    pub fn new(newuidmap: impl Into<PathBuf>, newgidmap: impl Into<PathBuf>) -> Self {
        Self {
            newuidmap: newuidmap.into(),
            newgidmap: newgidmap.into(),
        }
    }

    pub fn from_tools(tools: &ToolsConfig) -> Self {
        Self::new(tools.newuidmap.clone(), tools.newgidmap.clone())
    }

    /// Arguments for one invocation: the pid, then every mapping in order.
    pub fn mapping_args(pid: u32, mappings: &[IdMappingSpec]) -> Vec<String> {
        let mut args = Vec::with_capacity(1 + mappings.len() * 3);
        args.push(pid.to_string());
        for m in mappings {
            args.push(m.namespace_id.to_string());
            args.push(m.host_id.to_string());
            args.push(m.size.to_string());
        }
        args
    }

    async fn run(&self, tool: &Path, pid: u32, mappings: &[IdMappingSpec]) -> Result<()> {
        let args = Self::mapping_args(pid, mappings);

        tracing::debug!(tool = %tool.display(), args = ?args, "Applying ID mappings");

        let output = Command::new(tool).args(&args).output().await.map_err(|e| {
            RootfsError::ExternalTool {
                tool: tool.display().to_string(),
                status: "spawn failed".to_string(),
                output: e.to_string(),
            }
        })?;

        if !output.status.success() {
            return Err(RootfsError::ExternalTool {
                tool: tool.display().to_string(),
                status: output.status.to_string(),
                output: combined_output(&output.stdout, &output.stderr),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl IdMapper for CommandIdMapper {
    async fn map_uids(&self, pid: u32, mappings: &[IdMappingSpec]) -> Result<()> {
        self.run(&self.newuidmap, pid, mappings).await
    }

    async fn map_gids(&self, pid: u32, mappings: &[IdMappingSpec]) -> Result<()> {
        self.run(&self.newgidmap, pid, mappings).await
    }
}

/// Join stdout and stderr into one diagnostic string.
pub(crate) fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim_end();
    if !stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(stderr);
    }
    output
}
