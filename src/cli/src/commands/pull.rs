//! `a3s-rootfs pull` command.

use a3s_rootfs_core::config::StoreConfig;
use clap::Args;
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct PullArgs {
    /// Base image: a registry reference (e.g. "alpine:3.19") or a tarball path
    pub image: String,

    /// Only print the canonical reference
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: PullArgs,
    config: StoreConfig,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = super::open_manager(config)?;

    if !args.quiet {
        println!("Pulling {}...", args.image);
    }
    let pulled = manager.pull(&args.image, cancel).await?;

    if args.quiet {
        println!("{}", pulled.reference);
    } else {
        println!(
            "Pulled: {} ({} layers, {} new)",
            pulled.reference,
            pulled.info.layers.len(),
            pulled.created.len()
        );
    }
    Ok(())
}
