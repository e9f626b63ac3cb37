//! Volumes command - list volumes by worker, orphaned or failed

use crate::cli::args::{ArtifactAction, ArtifactArgs, OutputFormat};
use crate::cli::output;
use crate::config::Config;
use crate::error::StoreResult;
use crate::volume::{VolumeInfo, VolumeRepository, VolumeState};
use console::style;

/// Execute the volumes command
pub async fn execute(args: ArtifactArgs, config: &Config) -> StoreResult<()> {
    let repo = VolumeRepository::new(super::open_db(config).await?);

    let ArtifactAction::List {
        worker,
        orphaned,
        failed,
        format,
    } = args.action;

    let volumes: Vec<VolumeInfo> = if orphaned {
        repo.get_orphaned_volumes()?
            .iter()
            .map(|v| v.info().clone())
            .collect()
    } else if failed {
        repo.get_failed_volumes()?
            .iter()
            .map(|v| v.info().clone())
            .collect()
    } else {
        repo.list(worker.as_deref())?
    };

    if volumes.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => output::step_info("No volumes"),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_table(&volumes),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&volumes)?),
        OutputFormat::Plain => {
            for volume in &volumes {
                println!("{}", volume.handle);
            }
        }
    }

    Ok(())
}

fn print_table(volumes: &[VolumeInfo]) {
    output::intro("Volumes");

    println!(
        "{:<38} {:<16} {:<11} {:<19} {:<38}",
        style("HANDLE").bold(),
        style("WORKER").bold(),
        style("STATE").bold(),
        style("PAYLOAD").bold(),
        style("PARENT").bold()
    );
    println!("{}", "-".repeat(126));

    for volume in volumes {
        let state = match volume.state {
            VolumeState::Creating => style(volume.state.as_str()).yellow(),
            VolumeState::Created => style(volume.state.as_str()).green(),
            VolumeState::Destroying => style(volume.state.as_str()).dim(),
            VolumeState::Failed => style(volume.state.as_str()).red(),
        };

        println!(
            "{:<38} {:<16} {:<11} {:<19} {:<38}",
            volume.handle,
            volume.worker_name,
            state,
            volume.payload.kind(),
            volume.parent_handle.as_deref().unwrap_or("-")
        );
    }

    println!();
    println!("{} volume(s)", volumes.len());
}
