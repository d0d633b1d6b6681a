//! `a3s-rootfs list` command.

use a3s_rootfs_core::config::StoreConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct ListArgs {
    /// Only show image ids (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ListArgs, config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = super::open_manager(config)?;
    let images = manager.list()?;

    if args.quiet {
        for image in &images {
            println!("{}", image.id);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["ID", "BASE IMAGE", "LAYERS", "CREATED"]);
    for image in &images {
        table.add_row(&[
            image.id.clone(),
            image.base_image.clone(),
            image.chain_ids.len().to_string(),
            output::format_ago(&image.created_at),
        ]);
    }

    println!("{table}");
    Ok(())
}
