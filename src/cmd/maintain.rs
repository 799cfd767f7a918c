//! Out-of-band maintenance: `tendersync repair` and `tendersync housekeep`.

use anyhow::Result;
use console::style;

use tendersync::config::Config;
use tendersync::store::{StoreHandle, SyncStore};

/// Remove duplicate tender rows, keeping the newest row per identity group.
/// Safe to re-run; a clean store deletes nothing.
pub async fn cmd_repair(config: Config) -> Result<()> {
    config.ensure_directories()?;
    let store = StoreHandle::new(SyncStore::open(&config.db_path)?);
    let deleted = store.call(|s| s.repair_duplicates()).await?;
    if deleted == 0 {
        println!("{} store is clean; nothing to repair", style("✓").green().bold());
    } else {
        println!(
            "{} removed {} duplicate row(s)",
            style("✓").green().bold(),
            deleted
        );
    }
    Ok(())
}

/// Mark `running` runs older than the threshold with zero progress as
/// `timeout_cleaned`, freeing their portals.
pub async fn cmd_housekeep(config: Config, age_hours: i64) -> Result<()> {
    config.ensure_directories()?;
    let store = StoreHandle::new(SyncStore::open(&config.db_path)?);
    let threshold = chrono::Duration::hours(age_hours);
    let stuck = store.call(move |s| s.get_stuck_runs(threshold)).await?;

    if stuck.is_empty() {
        println!("{} no stuck runs", style("✓").green().bold());
        return Ok(());
    }
    for run in &stuck {
        let run_id = run.id;
        store.call(move |s| s.mark_timeout_cleaned(run_id)).await?;
        println!(
            "{} cleaned run #{} ({}, started {})",
            style("✓").green().bold(),
            run.id,
            run.portal_name,
            run.started_at
        );
    }
    println!("{} run(s) cleaned", stuck.len());
    Ok(())
}
