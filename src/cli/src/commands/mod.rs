//! CLI command definitions and dispatch.

mod clean;
mod create;
mod delete;
mod list;
mod pull;
mod stats;
pub mod unpack;

use std::path::PathBuf;

use a3s_rootfs_core::config::{DriverKind, IdMappingSpec, LogLevel, StoreConfig};
use a3s_rootfs_core::error::Result as RootfsResult;
use a3s_rootfs_runtime::ImageManager;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// A3S Rootfs - container root filesystem store.
#[derive(Parser)]
#[command(name = "a3s-rootfs", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command. Flags override the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// YAML configuration file
    #[arg(long, global = true, env = "A3S_ROOTFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Store root directory
    #[arg(long, global = true, env = "A3S_ROOTFS_STORE")]
    pub store: Option<PathBuf>,

    /// Filesystem driver: btrfs or dir
    #[arg(long, global = true)]
    pub driver: Option<DriverKind>,

    /// Log level: debug, info, warn or error (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// UID mapping for unpacked layers as nsID:hostID:size (repeatable)
    #[arg(long = "uid-mapping", global = true)]
    pub uid_mappings: Vec<IdMappingSpec>,

    /// GID mapping for unpacked layers as nsID:hostID:size (repeatable)
    #[arg(long = "gid-mapping", global = true)]
    pub gid_mappings: Vec<IdMappingSpec>,
}

impl GlobalArgs {
    /// Load the config file, if any, and apply flag overrides.
    pub fn resolve(&self) -> RootfsResult<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::load(path)?,
            None => StoreConfig::default(),
        };

        if let Some(store) = &self.store {
            config.store_path = store.clone();
        }
        if let Some(driver) = self.driver {
            config.driver = driver;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if !self.uid_mappings.is_empty() {
            config.uid_mappings = self.uid_mappings.clone();
        }
        if !self.gid_mappings.is_empty() {
            config.gid_mappings = self.gid_mappings.clone();
        }
        Ok(config)
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a base image
    Create(create::CreateArgs),
    /// Remove one or more images
    Delete(delete::DeleteArgs),
    /// Pull a base image into layer volumes
    Pull(pull::PullArgs),
    /// List images
    List(list::ListArgs),
    /// Show disk usage of an image or of the whole store
    Stats(stats::StatsArgs),
    /// Reclaim volumes no image depends on
    Clean(clean::CleanArgs),
    /// Extract a layer from stdin (internal re-exec entry point)
    #[command(hide = true)]
    Unpack(unpack::UnpackArgs),
}

/// Open the store described by `config`.
pub(crate) fn open_manager(config: StoreConfig) -> Result<ImageManager, Box<dyn std::error::Error>> {
    Ok(ImageManager::open(config)?)
}

/// Token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = interrupt_token();
    match cli.command {
        Command::Create(args) => create::execute(args, config, &cancel).await,
        Command::Delete(args) => delete::execute(args, config, &cancel).await,
        Command::Pull(args) => pull::execute(args, config, &cancel).await,
        Command::List(args) => list::execute(args, config).await,
        Command::Stats(args) => stats::execute(args, config).await,
        Command::Clean(args) => clean::execute(args, config, &cancel).await,
        Command::Unpack(args) => match unpack::execute(&args) {
            0 => Ok(()),
            code => Err(format!("unpack exited with status {code}").into()),
        },
    }
}
