//! `tendersync status` — portal-by-portal view of runs, store counts, and
//! manifest coverage.

use anyhow::Result;
use console::style;

use tendersync::config::Config;
use tendersync::manifest::Manifest;
use tendersync::store::models::RunStatus;
use tendersync::store::{StoreHandle, SyncStore};

pub async fn cmd_status(config: Config) -> Result<()> {
    config.ensure_directories()?;
    let store = StoreHandle::new(SyncStore::open(&config.db_path)?);
    let manifest = Manifest::load(&config.manifest_path);

    let portals = store.call(|s| s.list_portals()).await?;
    if portals.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!("{}", style("Portals").bold().underlined());
    for portal in portals {
        let p = portal.clone();
        let latest = store.call(move |s| s.latest_run(&p)).await?;
        let p = portal.clone();
        let tenders = store.call(move |s| s.tender_count(&p)).await?;
        let p = portal.clone();
        let placeholders = store.call(move |s| s.placeholder_tender_count(&p)).await?;

        println!("\n{}", style(&portal).cyan().bold());
        match latest {
            Some(run) => {
                let status = match run.status {
                    RunStatus::Completed => style(run.status.as_str()).green(),
                    RunStatus::Running => style(run.status.as_str()).yellow(),
                    _ => style(run.status.as_str()).red(),
                };
                println!(
                    "  last run: #{} [{}] started {} (extracted {}, skipped {})",
                    run.id,
                    status,
                    run.started_at,
                    run.extracted_total.unwrap_or(0),
                    run.skipped_total.unwrap_or(0),
                );
            }
            None => println!("  last run: none"),
        }
        println!("  stored tenders: {}", tenders);
        if placeholders > 0 {
            println!(
                "  {} rows with placeholder ids (exempt from dedup; review manually)",
                style(placeholders).yellow()
            );
        }
        if let Some(entry) = manifest.portal(&portal) {
            println!(
                "  manifest: {} known ids, {} processed departments, last run {}",
                entry.tender_ids.len(),
                entry.processed_departments.len(),
                entry.last_run.as_deref().unwrap_or("never"),
            );
        }
    }
    Ok(())
}
