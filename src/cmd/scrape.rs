//! `tendersync scrape <portal>` — one portal sync, end to end.

use std::path::PathBuf;

use anyhow::Result;
use console::style;

use tendersync::config::Config;
use tendersync::delta::DeltaMode;
use tendersync::errors::SyncError;
use tendersync::sync::{SyncEngine, SyncOptions};

pub async fn cmd_scrape(
    config: Config,
    portal: &str,
    only_new: bool,
    delta_mode: &str,
    dept_workers: usize,
    manifest_path: Option<PathBuf>,
) -> Result<()> {
    let delta_mode: DeltaMode = delta_mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let engine = SyncEngine::new(config)?;
    let options = SyncOptions {
        portal: portal.to_string(),
        only_new,
        delta_mode,
        dept_workers,
        manifest_path,
    };

    let result = engine.sync_portal(&options).await;
    engine.shutdown().await;

    match result {
        Ok(outcome) => {
            println!(
                "{} {} (run {}): {} inserted, {} duplicates skipped, {} extracted by worker",
                style("✓").green().bold(),
                portal,
                outcome.run_id,
                outcome.inserted,
                outcome.duplicates,
                outcome.summary.extracted,
            );
            if let Some(stats) = &outcome.delta_stats {
                println!(
                    "  delta: {} added, {} count-changed, {} removed",
                    stats.added, stats.count_changed, stats.removed
                );
            }
            Ok(())
        }
        Err(SyncError::PortalBusy { portal, run_id }) => {
            println!(
                "{} {} already has a live run (id {}); try again later or run housekeep",
                style("!").yellow().bold(),
                portal,
                run_id
            );
            anyhow::bail!("portal busy")
        }
        Err(e) => Err(e.into()),
    }
}
