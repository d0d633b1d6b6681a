//! `a3s-rootfs delete` command.

use a3s_rootfs_core::config::StoreConfig;
use clap::Args;
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct DeleteArgs {
    /// Image ids to remove
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Ignore images that do not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(
    args: DeleteArgs,
    config: StoreConfig,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = super::open_manager(config)?;

    let mut errors: Vec<String> = Vec::new();
    for id in &args.ids {
        match manager.delete(id, cancel).await {
            Ok(()) => println!("Deleted: {id}"),
            Err(e) if args.force && e.is_not_found() => continue,
            Err(e) => errors.push(format!("{id}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to delete image(s):\n{msg}").into())
    }
}
