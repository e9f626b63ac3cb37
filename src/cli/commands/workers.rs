//! Workers command - register, list and maintain workers

use crate::cli::args::{OutputFormat, WorkersAction, WorkersArgs};
use crate::cli::output;
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::ids::TeamId;
use crate::worker::{Worker, WorkerFactory, WorkerResourceType, WorkerSpec, WorkerState};
use console::style;
use std::path::Path;

/// Execute the workers command
pub async fn execute(args: WorkersArgs, config: &Config) -> StoreResult<()> {
    let factory = WorkerFactory::new(super::open_db(config).await?);

    match args.action {
        WorkersAction::List { format } => list(&factory, format),
        WorkersAction::Register {
            name,
            types,
            team,
            certs_path,
            file,
        } => {
            let spec = match file {
                Some(path) => read_spec(&path).await?,
                None => WorkerSpec {
                    name: name.ok_or_else(|| StoreError::User("worker name is required".into()))?,
                    team_id: team.map(TeamId),
                    resource_types: types
                        .into_iter()
                        .map(|(type_, image, version)| WorkerResourceType {
                            type_,
                            image,
                            version,
                        })
                        .collect(),
                    certs_path,
                },
            };
            register(&factory, &spec)
        }
        WorkersAction::State { name, state } => {
            let state: WorkerState = state.parse()?;
            factory.set_state(&name, state)?;
            output::step_ok(&format!("Worker {} is now {}", name, state));
            Ok(())
        }
        WorkersAction::Prune { name } => {
            factory.prune_worker(&name)?;
            output::step_ok(&format!("Pruned worker {}", name));
            Ok(())
        }
    }
}

async fn read_spec(path: &Path) -> StoreResult<WorkerSpec> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StoreError::io(format!("reading worker spec {}", path.display()), e))?;
    Ok(serde_json::from_str(&content)?)
}

fn register(factory: &WorkerFactory, spec: &WorkerSpec) -> StoreResult<()> {
    let worker = factory.save_worker(spec)?;
    output::step_ok_detail(
        &format!("Registered worker {}", worker.name),
        &format!("{} base type(s)", spec.resource_types.len()),
    );
    Ok(())
}

fn list(factory: &WorkerFactory, format: OutputFormat) -> StoreResult<()> {
    let workers = factory.workers()?;

    if workers.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => output::step_info("No workers registered"),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_table(&workers),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workers)?),
        OutputFormat::Plain => {
            for worker in &workers {
                println!("{}", worker.name);
            }
        }
    }

    Ok(())
}

fn print_table(workers: &[Worker]) {
    output::intro("Workers");

    println!(
        "{:<24} {:<10} {:<8} {:<20}",
        style("NAME").bold(),
        style("STATE").bold(),
        style("TEAM").bold(),
        style("STARTED").bold()
    );
    println!("{}", "-".repeat(65));

    for worker in workers {
        let state = match worker.state {
            WorkerState::Running => style(worker.state.as_str()).green(),
            WorkerState::Landing | WorkerState::Retiring => style(worker.state.as_str()).yellow(),
            WorkerState::Landed => style(worker.state.as_str()).dim(),
            WorkerState::Stalled => style(worker.state.as_str()).red(),
        };
        let team = worker
            .team_id
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<24} {:<10} {:<8} {:<20}",
            worker.name,
            state,
            team,
            worker.start_time.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("{} worker(s)", workers.len());
}
