//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// resgraph - resource identity and cache store for CI workers
///
/// Inspects and maintains the database of resource configs, caches,
/// worker projections, containers and volumes.
#[derive(Parser, Debug)]
#[command(name = "resgraph")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "RESGRAPH_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or upgrade the database schema
    Migrate,

    /// Register and inspect workers
    Workers(WorkersArgs),

    /// Inspect resource caches
    Caches(CachesArgs),

    /// Inspect containers
    Containers(ArtifactArgs),

    /// Inspect volumes
    Volumes(ArtifactArgs),

    /// Run garbage collection
    Gc(GcArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the workers command
#[derive(Parser, Debug)]
pub struct WorkersArgs {
    #[command(subcommand)]
    pub action: WorkersAction,
}

/// Worker subcommands
#[derive(Subcommand, Debug)]
pub enum WorkersAction {
    /// List registered workers
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Register or re-register a worker
    Register {
        /// Worker name
        #[arg(required_unless_present = "file")]
        name: Option<String>,

        /// Base resource type as TYPE=IMAGE@VERSION (repeatable)
        #[arg(short = 't', long = "type", value_parser = parse_resource_type)]
        types: Vec<(String, String, String)>,

        /// Team the worker is dedicated to
        #[arg(long)]
        team: Option<i64>,

        /// Path of the worker's CA certificates
        #[arg(long)]
        certs_path: Option<String>,

        /// Read the worker spec from a JSON file instead
        #[arg(long, conflicts_with_all = ["name", "types", "team", "certs_path"])]
        file: Option<PathBuf>,
    },

    /// Change a worker's state
    State {
        /// Worker name
        name: String,

        /// New state
        state: String,
    },

    /// Remove a stalled or landed worker and everything on it
    Prune {
        /// Worker name
        name: String,
    },
}

/// Arguments for the caches command
#[derive(Parser, Debug)]
pub struct CachesArgs {
    #[command(subcommand)]
    pub action: CachesAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CachesAction {
    /// List resource caches with their use and worker counts
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Arguments shared by the containers and volumes commands
#[derive(Parser, Debug)]
pub struct ArtifactArgs {
    #[command(subcommand)]
    pub action: ArtifactAction,
}

/// Container and volume subcommands
#[derive(Subcommand, Debug)]
pub enum ArtifactAction {
    /// List rows
    List {
        /// Only rows on this worker
        #[arg(short, long)]
        worker: Option<String>,

        /// Only rows whose owner or payload is gone
        #[arg(long, conflicts_with_all = ["failed", "worker"])]
        orphaned: bool,

        /// Only rows that failed to create
        #[arg(long, conflicts_with = "worker")]
        failed: bool,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Arguments for the gc command
#[derive(Parser, Debug)]
pub struct GcArgs {
    /// Keep collecting every gc.interval_secs until interrupted
    #[arg(short, long)]
    pub watch: bool,

    /// Dry run - show what would be collected
    #[arg(long)]
    pub dry_run: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for list commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Parse a base resource type in TYPE=IMAGE@VERSION format
fn parse_resource_type(s: &str) -> Result<(String, String, String), String> {
    let (name, rest) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid TYPE=IMAGE@VERSION format: no '=' found in '{s}'"))?;
    let (image, version) = rest
        .rsplit_once('@')
        .ok_or_else(|| format!("invalid TYPE=IMAGE@VERSION format: no '@' found in '{s}'"))?;
    if name.is_empty() || image.is_empty() || version.is_empty() {
        return Err(format!("invalid TYPE=IMAGE@VERSION format: empty part in '{s}'"));
    }
    Ok((name.to_string(), image.to_string(), version.to_string()))
}
