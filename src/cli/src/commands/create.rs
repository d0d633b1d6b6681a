//! `a3s-rootfs create` command.

use a3s_rootfs_core::config::StoreConfig;
use clap::Args;
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct CreateArgs {
    /// Image id (letters, digits, '-', '_', '.', ':')
    pub id: String,

    /// Base image: a registry reference (e.g. "alpine:3.19") or a tarball path
    pub base_image: String,

    /// Print the image record as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: CreateArgs,
    config: StoreConfig,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = super::open_manager(config)?;
    let record = manager.create(&args.id, &args.base_image, cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        let rootfs = manager.layout().images_dir().join(&record.id).join("rootfs");
        println!("{}", rootfs.display());
    }
    Ok(())
}
