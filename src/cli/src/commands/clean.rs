//! `a3s-rootfs clean` command.

use a3s_rootfs_core::config::StoreConfig;
use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::output;

#[derive(Args)]
pub struct CleanArgs {
    /// Only collect when volumes use more than this (e.g. "10g", "500m")
    #[arg(long)]
    pub threshold: Option<String>,

    /// Base image whose volumes survive collection (repeatable)
    #[arg(long = "keep")]
    pub keep: Vec<String>,

    /// Print the collection report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: CleanArgs,
    config: StoreConfig,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let threshold = match &args.threshold {
        Some(value) => Some(output::parse_size_bytes(value)?),
        None => config.clean.threshold_bytes,
    };
    let mut keep = config.clean.keep_images.clone();
    keep.extend(args.keep.iter().cloned());

    let manager = super::open_manager(config)?;
    let Some(report) = manager.clean(threshold, &keep, cancel).await? else {
        if !args.json {
            println!("Volume usage below threshold; nothing to do");
        }
        return Ok(());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for id in &report.destroyed {
            println!("Destroyed: {id}");
        }
        println!(
            "Reclaimed {} volume(s), kept {}, removed {} cached blob(s)",
            report.destroyed.len(),
            report.retained,
            report.blobs_removed
        );
    }
    Ok(())
}
