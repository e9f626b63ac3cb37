//! Caches command - list resource caches

use crate::cli::args::{CachesAction, CachesArgs, OutputFormat};
use crate::cli::output;
use crate::config::Config;
use crate::error::StoreResult;
use crate::resource::cache::ResourceCacheSummary;
use crate::resource::hash::version_json;
use crate::resource::ResourceCacheFactory;
use console::style;

/// Execute the caches command
pub async fn execute(args: CachesArgs, config: &Config) -> StoreResult<()> {
    let CachesAction::List { format } = args.action;
    let caches = ResourceCacheFactory::new(super::open_db(config).await?).list()?;

    if caches.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => output::step_info("No resource caches"),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_table(&caches),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&caches)?),
        OutputFormat::Plain => {
            for cache in &caches {
                println!("{}", cache.id);
            }
        }
    }

    Ok(())
}

fn print_table(caches: &[ResourceCacheSummary]) {
    output::intro("Resource caches");

    println!(
        "{:<8} {:<8} {:<14} {:<6} {:<8} {:<30}",
        style("ID").bold(),
        style("CONFIG").bold(),
        style("TYPE").bold(),
        style("USES").bold(),
        style("WORKERS").bold(),
        style("VERSION").bold()
    );
    println!("{}", "-".repeat(79));

    for cache in caches {
        let uses = if cache.uses == 0 {
            style(cache.uses.to_string()).dim()
        } else {
            style(cache.uses.to_string()).green()
        };

        println!(
            "{:<8} {:<8} {:<14} {:<6} {:<8} {:<30}",
            cache.id,
            cache.resource_config_id,
            cache.base_resource_type,
            uses,
            cache.workers,
            version_json(&cache.version)
        );
    }

    println!();
    println!("{} cache(s)", caches.len());
}
