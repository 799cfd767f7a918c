//! Typed error hierarchy for the tendersync engine.
//!
//! Two top-level enums cover the two subsystems that need matchable errors:
//! - `SupervisorError` — job lifecycle and process spawn failures
//! - `SyncError` — portal sync coordination failures
//!
//! Everything else flows through `anyhow` with context, the way the store
//! layer reports its failures.

use thiserror::Error;

/// Errors from the job supervisor and process runner.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Job {id} is already active")]
    JobAlreadyActive { id: String },

    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Failed to spawn worker process for job {id}: {source}")]
    SpawnFailed {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the portal sync coordinator.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Portal {portal} has a live run (id {run_id}); not force-starting")]
    PortalBusy { portal: String, run_id: i64 },

    #[error("Dedup store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("Worker process failed to start: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("Run {run_id} was cancelled")]
    Cancelled { run_id: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
