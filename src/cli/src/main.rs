//! A3S Rootfs CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use a3s_rootfs_cli::commands::{dispatch, unpack, Cli, Command};

fn init_tracing(default_level: &str) {
    // Logs go to stderr; stdout carries command output only
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    // Runs before any runtime descriptor can take fd 3. No config file either.
    if let Command::Unpack(args) = &cli.command {
        init_tracing("warn");
        std::process::exit(unpack::execute(args));
    }

    let config = match cli.global.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&tracing::Level::from(config.log_level).to_string().to_lowercase());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(dispatch(cli, config)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
