//! Containers command - list containers by worker, orphaned or failed

use crate::cli::args::{ArtifactAction, ArtifactArgs, OutputFormat};
use crate::cli::output;
use crate::config::Config;
use crate::container::{ContainerInfo, ContainerRepository, ContainerState};
use crate::error::StoreResult;
use console::style;

/// Execute the containers command
pub async fn execute(args: ArtifactArgs, config: &Config) -> StoreResult<()> {
    let repo = ContainerRepository::new(super::open_db(config).await?);

    let ArtifactAction::List {
        worker,
        orphaned,
        failed,
        format,
    } = args.action;

    let containers: Vec<ContainerInfo> = if orphaned {
        repo.find_orphaned_containers()?
            .iter()
            .map(|c| c.info().clone())
            .collect()
    } else if failed {
        repo.find_failed_containers()?
            .iter()
            .map(|c| c.info().clone())
            .collect()
    } else {
        repo.list(worker.as_deref())?
    };

    if containers.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => output::step_info("No containers"),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_table(&containers),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&containers)?),
        OutputFormat::Plain => {
            for container in &containers {
                println!("{}", container.handle);
            }
        }
    }

    Ok(())
}

fn print_table(containers: &[ContainerInfo]) {
    output::intro("Containers");

    println!(
        "{:<38} {:<16} {:<11} {:<30}",
        style("HANDLE").bold(),
        style("WORKER").bold(),
        style("STATE").bold(),
        style("OWNER").bold()
    );
    println!("{}", "-".repeat(98));

    for container in containers {
        let state = match container.state {
            ContainerState::Creating => style(container.state.as_str()).yellow(),
            ContainerState::Created => style(container.state.as_str()).green(),
            ContainerState::Destroying => style(container.state.as_str()).dim(),
            ContainerState::Failed => style(container.state.as_str()).red(),
        };
        let owner = container
            .owner
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<38} {:<16} {:<11} {:<30}",
            container.handle, container.worker_name, state, owner
        );
    }

    println!();
    println!("{} container(s)", containers.len());
}
