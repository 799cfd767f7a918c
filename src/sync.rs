//! Portal sync coordinator: the two-pass run flow.
//!
//! One `sync_portal` call owns a portal end to end: the resumability oracle
//! gates entry, a run row is created (or resumed), pass 1 covers the
//! requested departments, the delta planner turns pass 1's department
//! snapshot against the persisted baseline into pass 2's target list, and
//! the checkpoint artifact the worker wrote is merged into the store once
//! the final pass reaches a terminal state.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, ResumeAction, check_portal_resume, checkpoint_path};
use crate::config::Config;
use crate::delta::{
    DeltaMode, DeltaStats, DepartmentCount, PassStatus, PassSummary, load_snapshot, plan,
    sanitize_portal, save_snapshot, snapshot_path,
};
use crate::errors::{SupervisorError, SyncError};
use crate::events::WorkerEvent;
use crate::manifest::Manifest;
use crate::runner::SpawnSpec;
use crate::store::models::{NewTender, Run, RunStatus, ScopeMode, is_placeholder_id};
use crate::store::{InsertOutcome, StoreHandle, SyncStore};
use crate::supervisor::{JobState, JobSupervisor};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub portal: String,
    /// Incremental mode: seed the worker with known ids and plan deltas.
    pub only_new: bool,
    pub delta_mode: DeltaMode,
    pub dept_workers: usize,
    /// Overrides the configured manifest location.
    pub manifest_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub run_id: i64,
    pub status: RunStatus,
    pub resumed: bool,
    pub summary: PassSummary,
    pub inserted: usize,
    pub duplicates: usize,
    /// Stats from the delta sweep plan, when a second pass was planned.
    pub delta_stats: Option<DeltaStats>,
}

/// Result of observing one worker pass to its terminal state.
struct PassResult {
    summary: PassSummary,
    /// Snapshot from this pass's `departments_loaded` event, if any.
    departments: Option<Vec<DepartmentCount>>,
    cancelled: bool,
}

pub struct SyncEngine {
    config: Config,
    store: StoreHandle,
    supervisor: Arc<JobSupervisor>,
}

impl SyncEngine {
    pub fn new(config: Config) -> Result<Self, SyncError> {
        config.ensure_directories()?;
        let store = SyncStore::open(&config.db_path).map_err(SyncError::StoreUnavailable)?;
        let supervisor = JobSupervisor::new(config.supervisor_config());
        Ok(Self {
            config,
            store: StoreHandle::new(store),
            supervisor,
        })
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    /// Synchronize one portal. Returns `PortalBusy` if a young run with no
    /// evidence of progress still owns it, `Cancelled` if a pass was
    /// cancelled (by operator or stop request) after persisting what it got.
    pub async fn sync_portal(&self, options: &SyncOptions) -> Result<SyncOutcome, SyncError> {
        let portal = options.portal.as_str();
        let manifest_path = options
            .manifest_path
            .clone()
            .unwrap_or_else(|| self.config.manifest_path.clone());
        let cp_path = checkpoint_path(&self.config.checkpoints_dir, portal);

        // Oracle pre-flight.
        let action = check_portal_resume(
            &self.store,
            &self.config.checkpoints_dir,
            portal,
            self.config.stale_run_age,
        )
        .await?;
        let (run, resumed) = match action {
            ResumeAction::Wait { run } => {
                return Err(SyncError::PortalBusy {
                    portal: portal.to_string(),
                    run_id: run.id,
                });
            }
            ResumeAction::Resume { run } => (run, true),
            ResumeAction::StartNew | ResumeAction::Cleanup { .. } => {
                let scope = if options.only_new {
                    ScopeMode::Incremental
                } else {
                    ScopeMode::Full
                };
                let portal_owned = portal.to_string();
                let run = self
                    .store
                    .call(move |s| s.create_run(&portal_owned, scope))
                    .await?;
                (run, false)
            }
        };
        info!(portal, run_id = run.id, resumed, "Starting portal sync");

        let mut manifest = Manifest::load(&manifest_path);
        let known_ids_path = self.known_ids_path(portal);
        self.write_known_ids(&known_ids_path, portal, &manifest, &BTreeSet::new())
            .await?;

        // Pass 1: the full requested scope.
        let pass1 = self
            .run_pass(&run, "pass1", None, &known_ids_path, &cp_path, options)
            .await?;

        // Pass 2: delta sweep over the planner's targets, seeded with
        // everything pass 1 already saw.
        let mut delta_stats = None;
        let pass2 = if pass1.cancelled || pass1.summary.status == PassStatus::Error {
            PassResult {
                summary: PassSummary::empty(),
                departments: None,
                cancelled: false,
            }
        } else if let Some(latest) = &pass1.departments {
            let baseline = load_snapshot(&snapshot_path(&self.config.snapshots_dir, portal));
            // No baseline: a full plan is the only sound choice.
            let mode = if baseline.is_some() {
                options.delta_mode
            } else {
                DeltaMode::Full
            };
            let sweep = plan(mode, baseline.as_deref().unwrap_or(&[]), latest);
            if !sweep.removed.is_empty() {
                info!(portal, removed = sweep.removed.len(), "Departments no longer listed");
            }
            delta_stats = Some(sweep.stats.clone());
            if sweep.targets.is_empty() {
                debug!(portal, "Delta sweep has no targets; skipping second pass");
                PassResult {
                    summary: PassSummary::empty(),
                    departments: None,
                    cancelled: false,
                }
            } else {
                let pass1_ids = Checkpoint::load(&cp_path)
                    .map(|c| checkpoint_known_ids(&c))
                    .unwrap_or_default();
                self.write_known_ids(&known_ids_path, portal, &manifest, &pass1_ids)
                    .await?;
                let targets_path = self.write_targets(portal, &sweep.targets)?;
                self.run_pass(
                    &run,
                    "sweep",
                    Some(&targets_path),
                    &known_ids_path,
                    &cp_path,
                    options,
                )
                .await?
            }
        } else {
            warn!(portal, "Worker emitted no department snapshot; skipping delta sweep");
            PassResult {
                summary: PassSummary::empty(),
                departments: None,
                cancelled: false,
            }
        };

        // Merge the checkpoint into the store exactly once, after the last
        // pass went terminal.
        let (inserted, duplicates, merged_ids, merged_departments) =
            self.merge_checkpoint(&run, &cp_path).await?;

        let cancelled = pass1.cancelled || pass2.cancelled;
        let mut summary = pass1.summary.merge(pass2.summary);
        summary.tender_ids.extend(merged_ids);
        summary.departments.extend(merged_departments);

        let status = if cancelled || summary.status == PassStatus::Error {
            RunStatus::Error
        } else {
            RunStatus::Completed
        };
        // Per-pass progress events only raised the ledger to the larger
        // single pass; the merged totals are the run's real counters.
        let run_id = run.id;
        let (expected, extracted, skipped) = (
            summary.expected as i64,
            summary.extracted as i64,
            summary.skipped as i64,
        );
        self.store
            .call(move |s| s.update_run_progress(run_id, Some(expected), extracted, skipped))
            .await?;
        self.store
            .call(move |s| s.finish_run(run_id, status))
            .await?;

        manifest.record_run(portal, &summary);
        manifest.save(&manifest_path)?;

        if let Some(latest) = pass1.departments.as_deref() {
            save_snapshot(&snapshot_path(&self.config.snapshots_dir, portal), latest)?;
        }
        if status == RunStatus::Completed {
            Checkpoint::delete(&cp_path)?;
        }

        if cancelled {
            return Err(SyncError::Cancelled { run_id: run.id });
        }
        info!(
            portal,
            run_id = run.id,
            inserted,
            duplicates,
            extracted = summary.extracted,
            "Portal sync finished"
        );
        Ok(SyncOutcome {
            run_id: run.id,
            status,
            resumed,
            summary,
            inserted,
            duplicates,
            delta_stats,
        })
    }

    /// Launch one worker pass and pump its events until the job is terminal.
    async fn run_pass(
        &self,
        run: &Run,
        pass: &str,
        targets_path: Option<&Path>,
        known_ids_path: &Path,
        cp_path: &Path,
        options: &SyncOptions,
    ) -> Result<PassResult, SyncError> {
        let portal = options.portal.as_str();
        let job_id = self
            .supervisor
            .create_job_id(&format!("{}-{}", sanitize_portal(portal), pass));

        let mut spec = worker_spec(&self.config.worker_cmd)?
            .args(["--portal", portal])
            .args(["--job-id", &job_id])
            .arg("--checkpoint")
            .arg(cp_path.display().to_string())
            .arg("--known-ids")
            .arg(known_ids_path.display().to_string())
            .args(["--dept-workers", &options.dept_workers.to_string()]);
        if let Some(path) = targets_path {
            spec = spec.arg("--departments").arg(path.display().to_string());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.supervisor
            .start_job(&job_id, spec, portal, Some(tx))
            .map_err(|e| match e {
                SupervisorError::SpawnFailed { source, .. } => SyncError::WorkerSpawn(source),
                other => SyncError::Other(anyhow!(other)),
            })?;

        let mut summary = PassSummary::empty();
        let mut departments: Option<Vec<DepartmentCount>> = None;
        let mut terminal: Option<WorkerEvent> = None;
        while let Some(stamped) = rx.recv().await {
            match stamped.event {
                WorkerEvent::DepartmentsLoaded {
                    departments: snapshot,
                } => {
                    summary.expected = summary
                        .expected
                        .max(snapshot.iter().map(|d| d.count).sum());
                    departments = Some(snapshot);
                }
                WorkerEvent::Progress {
                    extracted,
                    skipped,
                    expected,
                    department,
                } => {
                    summary.extracted = summary.extracted.max(extracted);
                    summary.skipped = summary.skipped.max(skipped);
                    if let Some(expected) = expected {
                        summary.expected = summary.expected.max(expected);
                    }
                    if let Some(department) = department {
                        summary.departments.insert(department);
                    }
                    let run_id = run.id;
                    let (exp, ext, skp) = (
                        expected.map(|v| v as i64),
                        extracted as i64,
                        skipped as i64,
                    );
                    self.store
                        .call(move |s| s.update_run_progress(run_id, exp, ext, skp))
                        .await?;
                }
                WorkerEvent::Completed { extracted, skipped } => {
                    summary.extracted = summary.extracted.max(extracted);
                    summary.skipped = summary.skipped.max(skipped);
                    terminal = Some(WorkerEvent::Completed { extracted, skipped });
                }
                WorkerEvent::Error { message } => {
                    warn!(job_id = %job_id, "Worker reported error: {}", message);
                    terminal = Some(WorkerEvent::Error { message });
                }
                WorkerEvent::Cancelled { reason } => {
                    info!(job_id = %job_id, ?reason, "Worker reported cancellation");
                    terminal = Some(WorkerEvent::Cancelled { reason });
                }
                WorkerEvent::Status { message } => {
                    debug!(job_id = %job_id, "{}", message);
                }
                WorkerEvent::Start { .. }
                | WorkerEvent::Portal { .. }
                | WorkerEvent::Unknown { .. } => {}
            }
        }

        let job = self
            .supervisor
            .wait_for_terminal(&job_id)
            .await
            .map_err(|e| SyncError::Other(anyhow!(e)))?;
        debug!(job_id = %job_id, state = %job.state, code = ?job.exit_code, "Pass finished");

        // The structured terminal event wins; the job's exit classification
        // is the fallback for workers that died without saying goodbye.
        let (status, cancelled) = match (&terminal, job.state) {
            (Some(WorkerEvent::Completed { .. }), JobState::Completed) => {
                (PassStatus::Completed, false)
            }
            (Some(WorkerEvent::Cancelled { .. }), _) | (_, JobState::Cancelled) => {
                (PassStatus::Error, true)
            }
            (Some(WorkerEvent::Error { .. }), _) => (PassStatus::Error, false),
            (None, JobState::Completed) => (PassStatus::Completed, false),
            _ => (PassStatus::Error, false),
        };
        summary.status = status;

        Ok(PassResult {
            summary,
            departments,
            cancelled,
        })
    }

    /// Insert every checkpointed item; the store's constraint decides what
    /// is a duplicate. Returns what moved plus the id/department sets for
    /// the manifest.
    async fn merge_checkpoint(
        &self,
        run: &Run,
        cp_path: &Path,
    ) -> Result<(usize, usize, BTreeSet<String>, BTreeSet<String>), SyncError> {
        let Some(checkpoint) = Checkpoint::load(cp_path) else {
            return Ok((0, 0, BTreeSet::new(), BTreeSet::new()));
        };

        let mut ids = BTreeSet::new();
        let mut inserted = 0usize;
        let mut duplicates = 0usize;
        let portal = run.portal_name.clone();
        let run_id = run.id;

        for item in &checkpoint.items {
            if !is_placeholder_id(&item.tender_id) {
                ids.insert(item.tender_id.clone());
            }
            let tender = NewTender {
                run_id,
                portal_name: portal.clone(),
                department_name: item.department.clone(),
                tender_id: item.tender_id.clone(),
                closing_date: item.closing_date.clone(),
                title: item.title.clone(),
                description: item.description.clone(),
                source_url: item.source_url.clone(),
            };
            match self.store.call(move |s| s.insert_tender(&tender)).await? {
                InsertOutcome::Inserted(_) => inserted += 1,
                InsertOutcome::Duplicate => {
                    duplicates += 1;
                    debug!(portal = %portal, "Skipped duplicate tender");
                }
            }
        }
        debug!(portal = %run.portal_name, inserted, duplicates, "Merged checkpoint into store");
        Ok((
            inserted,
            duplicates,
            ids,
            checkpoint.processed_departments.clone(),
        ))
    }

    fn known_ids_path(&self, portal: &str) -> PathBuf {
        self.config
            .state_dir
            .join(format!("{}_known_ids.json", sanitize_portal(portal)))
    }

    /// Known ids = manifest ∪ authoritative store rows ∪ `extra` (what the
    /// current run has already pulled).
    async fn write_known_ids(
        &self,
        path: &Path,
        portal: &str,
        manifest: &Manifest,
        extra: &BTreeSet<String>,
    ) -> Result<(), SyncError> {
        let mut ids = manifest.known_ids(portal);
        let portal_owned = portal.to_string();
        let stored = self
            .store
            .call(move |s| s.tender_ids_for_portal(&portal_owned))
            .await?;
        ids.extend(stored);
        ids.extend(extra.iter().cloned());

        let data = serde_json::to_string(&ids).context("Failed to encode known ids")?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn write_targets(
        &self,
        portal: &str,
        targets: &[DepartmentCount],
    ) -> Result<PathBuf, SyncError> {
        let path = self
            .config
            .state_dir
            .join(format!("{}_targets.json", sanitize_portal(portal)));
        let data = serde_json::to_string(targets).context("Failed to encode targets")?;
        std::fs::write(&path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Natural keys a checkpoint contributes to the known-id set. Placeholder
/// ids are excluded; a worker must never treat "n/a" as already seen.
fn checkpoint_known_ids(checkpoint: &Checkpoint) -> BTreeSet<String> {
    checkpoint
        .items
        .iter()
        .filter(|i| !is_placeholder_id(&i.tender_id))
        .map(|i| i.tender_id.clone())
        .collect()
}

/// Split the configured worker command into program + leading args.
fn worker_spec(worker_cmd: &str) -> Result<SpawnSpec, SyncError> {
    let mut parts = worker_cmd.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| SyncError::Other(anyhow!("worker_cmd is empty")))?;
    Ok(SpawnSpec::new(program).args(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_spec_splits_command() {
        let spec = worker_spec("python3 scraper.py --headless").unwrap();
        assert_eq!(spec.command, "python3");
        assert_eq!(spec.args, vec!["scraper.py", "--headless"]);
    }

    #[test]
    fn test_worker_spec_rejects_empty() {
        assert!(worker_spec("   ").is_err());
    }

    fn item(tender_id: &str) -> crate::checkpoint::CheckpointItem {
        crate::checkpoint::CheckpointItem {
            department: "Health".to_string(),
            tender_id: tender_id.to_string(),
            closing_date: "2026-09-30".to_string(),
            title: String::new(),
            description: String::new(),
            source_url: None,
        }
    }

    #[test]
    fn test_checkpoint_known_ids_drops_placeholders() {
        let mut checkpoint = Checkpoint::new("demo");
        checkpoint.items = vec![item("T-1"), item("n/a"), item("-"), item("T-2")];

        let ids = checkpoint_known_ids(&checkpoint);
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["T-1".to_string(), "T-2".to_string()]
        );
    }
}
