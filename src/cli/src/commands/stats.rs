//! `a3s-rootfs stats` command.

use a3s_rootfs_core::config::StoreConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct StatsArgs {
    /// Image id; omit for usage of the whole store
    pub id: Option<String>,

    /// Print raw numbers as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: StatsArgs, config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = super::open_manager(config)?;

    let Some(id) = &args.id else {
        let usage = manager.store_usage().await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&usage)?);
            return Ok(());
        }

        let mut table = output::new_table(&["TYPE", "COUNT", "SIZE"]);
        table.add_row(&["Images".to_string(), usage.images.to_string(), String::new()]);
        table.add_row(&[
            "Volumes".to_string(),
            usage.volumes.to_string(),
            output::format_bytes(usage.volume_bytes),
        ]);
        table.add_row(&[
            "Incomplete volumes".to_string(),
            usage.incomplete_volumes.to_string(),
            String::new(),
        ]);
        table.add_row(&[
            "Cached blobs".to_string(),
            usage.cached_blobs.to_string(),
            output::format_bytes(usage.cache_bytes),
        ]);
        table.add_row(&[
            "Dependency records".to_string(),
            usage.dependency_owners.to_string(),
            String::new(),
        ]);
        println!("{table}");
        return Ok(());
    };

    let stats = manager.stats(id).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let mut table = output::new_table(&["ID", "BASE IMAGE", "LAYERS", "DISK USAGE"]);
    table.add_row(&[
        stats.id.clone(),
        stats.base_image.clone(),
        stats.layers.to_string(),
        output::format_bytes(stats.disk_usage),
    ]);
    println!("{table}");
    Ok(())
}
