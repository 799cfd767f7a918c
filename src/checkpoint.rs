//! Checkpoint artifact and the resumability oracle.
//!
//! Workers append extracted items and finished departments to a per-portal
//! checkpoint file while a run is live. The oracle reads the latest running
//! run plus this artifact to decide whether a portal sync should resume,
//! wait, clean up a dead run, or start fresh.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::delta::sanitize_portal;
use crate::store::{StoreHandle, models::Run};

/// One extracted item parked in the checkpoint until the coordinator merges
/// it into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointItem {
    pub department: String,
    pub tender_id: String,
    pub closing_date: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Per-portal checkpoint file. Rewritten whole on every worker flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub portal: String,
    #[serde(default)]
    pub items: Vec<CheckpointItem>,
    #[serde(default)]
    pub processed_departments: BTreeSet<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Checkpoint {
    pub fn new(portal: &str) -> Self {
        Self {
            portal: portal.to_string(),
            ..Default::default()
        }
    }

    /// A checkpoint carries progress if it holds any item or any finished
    /// department.
    pub fn has_progress(&self) -> bool {
        !self.items.is_empty() || !self.processed_departments.is_empty()
    }

    /// Load tolerantly: missing or corrupt files read as `None` so the
    /// oracle falls back to run-counter evidence alone.
    pub fn load(path: &Path) -> Option<Checkpoint> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read checkpoint");
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt checkpoint; ignoring");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create checkpoint directory")?;
        }
        let mut stamped = self.clone();
        stamped.updated_at = Some(Utc::now().to_rfc3339());
        let data = serde_json::to_string_pretty(&stamped).context("Failed to encode checkpoint")?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Remove the artifact after a successful merge. Absence is not an error.
    pub fn delete(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

/// Path of the checkpoint artifact for a portal.
pub fn checkpoint_path(checkpoints_dir: &Path, portal: &str) -> PathBuf {
    checkpoints_dir.join(format!("{}.json", sanitize_portal(portal)))
}

/// What the oracle decided for a portal.
#[derive(Debug, Clone)]
pub enum ResumeAction {
    /// No live run; start a fresh one.
    StartNew,
    /// A prior run showed progress; continue it with checkpoint state.
    Resume { run: Run },
    /// A young run is (or may still be) alive; do not touch it.
    Wait { run: Run },
    /// An old run with zero progress was cleaned; start fresh.
    Cleanup { run: Run },
}

/// A run is worth resuming if it demonstrably got anywhere: either its
/// progress counters moved or its checkpoint holds data.
pub fn is_run_resumable(run: &Run, checkpoint: Option<&Checkpoint>) -> bool {
    run.has_progress() || checkpoint.is_some_and(|c| c.has_progress())
}

/// Decide how a requested sync for `portal` should begin.
///
/// A resumable run is resumed regardless of age. A run with no evidence of
/// progress is left alone while young (it may still be warming up) and
/// marked `timeout_cleaned` once older than `age_threshold`.
pub async fn check_portal_resume(
    store: &StoreHandle,
    checkpoints_dir: &Path,
    portal: &str,
    age_threshold: Duration,
) -> Result<ResumeAction> {
    let portal_owned = portal.to_string();
    let running = store
        .call(move |s| s.latest_running_run(&portal_owned))
        .await?;
    let Some(run) = running else {
        return Ok(ResumeAction::StartNew);
    };

    let checkpoint = Checkpoint::load(&checkpoint_path(checkpoints_dir, portal));
    if is_run_resumable(&run, checkpoint.as_ref()) {
        info!(portal, run_id = run.id, "Resuming interrupted run");
        return Ok(ResumeAction::Resume { run });
    }

    if run.age(Utc::now()) < age_threshold {
        return Ok(ResumeAction::Wait { run });
    }

    info!(portal, run_id = run.id, "Cleaning up stale run with no progress");
    let run_id = run.id;
    store.call(move |s| s.mark_timeout_cleaned(run_id)).await?;
    Ok(ResumeAction::Cleanup { run })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SyncStore;
    use crate::store::models::ScopeMode;

    fn item(dept: &str, id: &str) -> CheckpointItem {
        CheckpointItem {
            department: dept.to_string(),
            tender_id: id.to_string(),
            closing_date: "2026-09-30".to_string(),
            title: String::new(),
            description: String::new(),
            source_url: None,
        }
    }

    fn store_handle() -> StoreHandle {
        StoreHandle::new(SyncStore::open_in_memory().unwrap())
    }

    fn backdate(store: &StoreHandle, run_id: i64, hours: i64) {
        let past = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        store
            .lock_sync()
            .unwrap()
            .set_run_started_at(run_id, &past)
            .unwrap();
    }

    #[test]
    fn test_checkpoint_progress() {
        let mut cp = Checkpoint::new("etenders");
        assert!(!cp.has_progress());
        cp.processed_departments.insert("Health".into());
        assert!(cp.has_progress());

        let mut cp = Checkpoint::new("etenders");
        cp.items.push(item("Health", "T-1"));
        assert!(cp.has_progress());
    }

    #[test]
    fn test_checkpoint_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "etenders");

        assert!(Checkpoint::load(&path).is_none());

        let mut cp = Checkpoint::new("etenders");
        cp.items.push(item("Health", "T-1"));
        cp.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.items, cp.items);
        assert!(loaded.updated_at.is_some());

        Checkpoint::delete(&path).unwrap();
        assert!(Checkpoint::load(&path).is_none());
        // Deleting again is fine.
        Checkpoint::delete(&path).unwrap();
    }

    #[test]
    fn test_corrupt_checkpoint_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "etenders");
        std::fs::write(&path, "]]").unwrap();
        assert!(Checkpoint::load(&path).is_none());
    }

    #[tokio::test]
    async fn test_oracle_start_new_when_nothing_running() {
        let store = store_handle();
        let dir = tempfile::tempdir().unwrap();
        let action = check_portal_resume(&store, dir.path(), "etenders", Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(action, ResumeAction::StartNew));
    }

    #[tokio::test]
    async fn test_oracle_resumes_run_with_counter_progress() {
        let store = store_handle();
        let dir = tempfile::tempdir().unwrap();
        let run = store
            .call(|s| s.create_run("etenders", ScopeMode::Incremental))
            .await
            .unwrap();
        store
            .call(move |s| s.update_run_progress(run.id, None, 5, 0))
            .await
            .unwrap();

        let expected_id = run.id;
        let action = check_portal_resume(&store, dir.path(), "etenders", Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(action, ResumeAction::Resume { run } if run.id == expected_id));
    }

    #[tokio::test]
    async fn test_oracle_resumes_old_run_with_checkpoint_data() {
        let store = store_handle();
        let dir = tempfile::tempdir().unwrap();
        let run = store
            .call(|s| s.create_run("etenders", ScopeMode::Full))
            .await
            .unwrap();
        backdate(&store, run.id, 48);

        let mut cp = Checkpoint::new("etenders");
        cp.items.push(item("Health", "T-1"));
        cp.save(&checkpoint_path(dir.path(), "etenders")).unwrap();

        let action = check_portal_resume(&store, dir.path(), "etenders", Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(action, ResumeAction::Resume { .. }));
    }

    #[tokio::test]
    async fn test_oracle_waits_on_young_run_without_progress() {
        let store = store_handle();
        let dir = tempfile::tempdir().unwrap();
        store
            .call(|s| s.create_run("etenders", ScopeMode::Full))
            .await
            .unwrap();

        let action = check_portal_resume(&store, dir.path(), "etenders", Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(action, ResumeAction::Wait { .. }));
    }

    #[tokio::test]
    async fn test_oracle_cleans_old_run_without_progress() {
        let store = store_handle();
        let dir = tempfile::tempdir().unwrap();
        let run = store
            .call(|s| s.create_run("etenders", ScopeMode::Full))
            .await
            .unwrap();
        backdate(&store, run.id, 48);

        let action = check_portal_resume(&store, dir.path(), "etenders", Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(action, ResumeAction::Cleanup { .. }));

        let run_id = run.id;
        let cleaned = store.call(move |s| s.get_run(run_id)).await.unwrap().unwrap();
        assert_eq!(cleaned.status.as_str(), "timeout_cleaned");
        // The portal is free again.
        let next = check_portal_resume(&store, dir.path(), "etenders", Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(next, ResumeAction::StartNew));
    }
}
