//! resgraph - resource identity and cache store
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use resgraph::cli::{commands, Cli, Commands};
use resgraph::config::ConfigManager;
use resgraph::error::StoreResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> StoreResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("resgraph=warn"),
        1 => EnvFilter::new("resgraph=info"),
        _ => EnvFilter::new("resgraph=debug"),
    };

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .without_time()
            .init();
    }

    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Migrate => commands::migrate(&config).await,
        Commands::Workers(args) => commands::workers(args, &config).await,
        Commands::Caches(args) => commands::caches(args, &config).await,
        Commands::Containers(args) => commands::containers(args, &config).await,
        Commands::Volumes(args) => commands::volumes(args, &config).await,
        Commands::Gc(args) => commands::gc(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, &config_manager).await,
    }
}
