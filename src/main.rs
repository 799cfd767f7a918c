use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "tendersync")]
#[command(version, about = "Incremental sync orchestrator for procurement portal scrapers")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding tendersync.toml and the .tendersync state
    /// dir. Defaults to the current directory.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a sync for one portal
    Scrape {
        /// Portal name, as the worker knows it
        portal: String,

        /// Incremental mode: seed the worker with known ids and plan deltas
        #[arg(long)]
        only_new: bool,

        /// Delta sweep targeting: quick or full
        #[arg(long, default_value = "quick")]
        delta_mode: String,

        /// Browser workers per job
        #[arg(long, default_value = "4")]
        dept_workers: usize,

        /// Override the manifest file location
        #[arg(long)]
        manifest_path: Option<PathBuf>,
    },
    /// Show per-portal run history and manifest counters
    Status,
    /// Remove duplicate tender rows, keeping the newest per identity
    Repair,
    /// Clean up stale runs that never made progress
    Housekeep {
        /// Age threshold in hours
        #[arg(long, default_value = "24")]
        age_hours: i64,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "tendersync=debug" } else { "tendersync=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let config = tendersync::config::Config::load(project_dir, cli.verbose)?;

    match &cli.command {
        Commands::Scrape {
            portal,
            only_new,
            delta_mode,
            dept_workers,
            manifest_path,
        } => {
            cmd::cmd_scrape(
                config,
                portal,
                *only_new,
                delta_mode,
                *dept_workers,
                manifest_path.clone(),
            )
            .await
        }
        Commands::Status => cmd::cmd_status(config).await,
        Commands::Repair => cmd::cmd_repair(config).await,
        Commands::Housekeep { age_hours } => cmd::cmd_housekeep(config, *age_hours).await,
    }
}
