//! Job supervisor: the authoritative lifecycle state of every supervised
//! worker process, plus the liveness watchdog.
//!
//! State machine per job: `starting → running → {completed, failed,
//! cancelled}` and `running → stopping → {cancelled, failed}`. Any observed
//! output (structured event, log line, stderr line) counts as a heartbeat;
//! the watchdog force-fails jobs whose heartbeat goes stale. All job-state
//! mutation happens under a short-lived lock, never across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::SupervisorError;
use crate::events::StampedEvent;
use crate::runner::{ProcessRunner, RunnerMessage, SpawnSpec};

/// Heartbeat timeouts below this are clamped up; a worker loading a heavy
/// portal page can legitimately go quiet for tens of seconds.
pub const MIN_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Max silence before the watchdog declares a job dead.
    pub heartbeat_timeout: Duration,
    /// Watchdog scan interval.
    pub watchdog_poll: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(180),
            watchdog_poll: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    /// Apply the heartbeat floor.
    pub fn normalized(mut self) -> Self {
        if self.heartbeat_timeout < MIN_HEARTBEAT_TIMEOUT {
            warn!(
                configured_secs = self.heartbeat_timeout.as_secs(),
                floor_secs = MIN_HEARTBEAT_TIMEOUT.as_secs(),
                "Heartbeat timeout below floor; clamping"
            );
            self.heartbeat_timeout = MIN_HEARTBEAT_TIMEOUT;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Active jobs occupy a slot: they have a live (or launching) process.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copy-out view of one job for callers. Terminal jobs stay queryable.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: String,
    pub group: String,
    pub state: JobState,
    pub last_event_kind: Option<String>,
    pub heartbeat_age: Duration,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
}

struct JobEntry {
    group: String,
    state: JobState,
    runner: Option<ProcessRunner>,
    last_heartbeat: Instant,
    last_event_kind: Option<String>,
    exit_code: Option<i32>,
    failure_reason: Option<String>,
}

impl JobEntry {
    fn snapshot(&self, id: &str) -> JobSnapshot {
        JobSnapshot {
            id: id.to_string(),
            group: self.group.clone(),
            state: self.state,
            last_event_kind: self.last_event_kind.clone(),
            heartbeat_age: self.last_heartbeat.elapsed(),
            exit_code: self.exit_code,
            failure_reason: self.failure_reason.clone(),
        }
    }
}

pub struct JobSupervisor {
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
    config: SupervisorConfig,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl JobSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            config,
            watchdog: Mutex::new(None),
        });
        let handle = tokio::spawn(watchdog_loop(
            supervisor.jobs.clone(),
            supervisor.config.clone(),
        ));
        if let Ok(mut slot) = supervisor.watchdog.lock() {
            *slot = Some(handle);
        }
        supervisor
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Mint a unique job id. Never reused: uuid-backed, not a counter.
    pub fn create_job_id(&self, prefix: &str) -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("{}-{}", prefix, &uuid[..8])
    }

    /// Launch a supervised process under `id`. Fails if that id is already
    /// active. Structured events are forwarded to `events` when given; log
    /// and stderr lines go to the log.
    pub fn start_job(
        self: &Arc<Self>,
        id: &str,
        spec: SpawnSpec,
        group: &str,
        events: Option<mpsc::UnboundedSender<StampedEvent>>,
    ) -> Result<(), SupervisorError> {
        {
            let mut jobs = lock_jobs(&self.jobs)?;
            if let Some(existing) = jobs.get(id)
                && existing.state.is_active()
            {
                return Err(SupervisorError::JobAlreadyActive { id: id.to_string() });
            }
            jobs.insert(
                id.to_string(),
                JobEntry {
                    group: group.to_string(),
                    state: JobState::Starting,
                    runner: None,
                    last_heartbeat: Instant::now(),
                    last_event_kind: None,
                    exit_code: None,
                    failure_reason: None,
                },
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let runner = match ProcessRunner::spawn(&spec, tx) {
            Ok(runner) => runner,
            Err(e) => {
                if let Ok(mut jobs) = lock_jobs(&self.jobs) {
                    jobs.remove(id);
                }
                return Err(SupervisorError::SpawnFailed {
                    id: id.to_string(),
                    source: e,
                });
            }
        };
        info!(job_id = id, group, pid = runner.pid(), "Started job");

        let stopped_while_starting = self.attach_runner(id, runner.clone())?;
        if stopped_while_starting {
            // A stop raced the spawn: the entry already left `starting`, so
            // nobody else holds a runner to signal. Kill the fresh process
            // and let its exit classify under the recorded state.
            info!(job_id = id, "Job stopped while starting; killing process");
            tokio::spawn(async move { runner.kill().await });
        }

        tokio::spawn(dispatch_loop(
            id.to_string(),
            self.jobs.clone(),
            rx,
            events,
        ));
        Ok(())
    }

    /// Hand the spawned process to the job entry. The `starting → running`
    /// transition only fires if the job is still `starting`; returns `true`
    /// when it is not, meaning a concurrent stop already claimed the job.
    fn attach_runner(&self, id: &str, runner: ProcessRunner) -> Result<bool, SupervisorError> {
        let mut jobs = lock_jobs(&self.jobs)?;
        let Some(entry) = jobs.get_mut(id) else {
            return Ok(true);
        };
        entry.runner = Some(runner);
        entry.last_heartbeat = Instant::now();
        if entry.state == JobState::Starting {
            entry.state = JobState::Running;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    pub fn get_job(&self, id: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().ok()?;
        jobs.get(id).map(|entry| entry.snapshot(id))
    }

    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        match self.jobs.lock() {
            Ok(jobs) => jobs.iter().map(|(id, e)| e.snapshot(id)).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Request termination. Moves the job to `stopping` first so a nonzero
    /// exit classifies as cancelled, then signals outside the lock.
    pub async fn stop_job(
        &self,
        id: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<(), SupervisorError> {
        let runner = {
            let mut jobs = lock_jobs(&self.jobs)?;
            let entry = jobs
                .get_mut(id)
                .ok_or_else(|| SupervisorError::JobNotFound { id: id.to_string() })?;
            if entry.state.is_terminal() {
                return Ok(());
            }
            entry.state = JobState::Stopping;
            entry.runner.clone()
        };
        debug!(job_id = id, force, "Stopping job");

        if let Some(runner) = runner {
            if force {
                runner.kill().await;
            } else {
                runner.stop(timeout).await;
            }
        }
        Ok(())
    }

    /// Gracefully stop every active job carrying the given group tag.
    pub async fn stop_group(&self, group: &str) -> Result<usize, SupervisorError> {
        let ids: Vec<String> = {
            let jobs = lock_jobs(&self.jobs)?;
            jobs.iter()
                .filter(|(_, e)| e.state.is_active() && e.group == group)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &ids {
            self.stop_job(id, false, self.config.stop_grace).await?;
        }
        Ok(ids.len())
    }

    pub async fn stop_all(&self) -> Result<usize, SupervisorError> {
        let ids: Vec<String> = {
            let jobs = lock_jobs(&self.jobs)?;
            jobs.iter()
                .filter(|(_, e)| e.state.is_active())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &ids {
            self.stop_job(id, false, self.config.stop_grace).await?;
        }
        Ok(ids.len())
    }

    /// Block until the job reaches a terminal state and return its snapshot.
    pub async fn wait_for_terminal(&self, id: &str) -> Result<JobSnapshot, SupervisorError> {
        loop {
            let snapshot = self
                .get_job(id)
                .ok_or_else(|| SupervisorError::JobNotFound { id: id.to_string() })?;
            if snapshot.state.is_terminal() {
                return Ok(snapshot);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Stop all jobs and the watchdog.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_all().await {
            error!(error = %e, "Error stopping jobs during shutdown");
        }
        if let Ok(mut slot) = self.watchdog.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

fn lock_jobs(
    jobs: &Arc<Mutex<HashMap<String, JobEntry>>>,
) -> Result<std::sync::MutexGuard<'_, HashMap<String, JobEntry>>, SupervisorError> {
    jobs.lock()
        .map_err(|e| SupervisorError::Other(anyhow::anyhow!("Job table lock poisoned: {}", e)))
}

/// Per-job message pump: heartbeats, event forwarding, exit classification.
async fn dispatch_loop(
    id: String,
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
    mut rx: mpsc::UnboundedReceiver<RunnerMessage>,
    events: Option<mpsc::UnboundedSender<StampedEvent>>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            RunnerMessage::Event(event) => {
                let kind = event.event.kind().to_string();
                heartbeat(&jobs, &id, &kind);
                if let Some(tx) = &events {
                    let _ = tx.send(event);
                }
            }
            RunnerMessage::Log(line) => {
                heartbeat(&jobs, &id, "log");
                debug!(job_id = %id, "{}", line);
            }
            RunnerMessage::ErrLine(line) => {
                heartbeat(&jobs, &id, "stderr");
                warn!(job_id = %id, "{}", line);
            }
            RunnerMessage::Exited(code) => {
                classify_exit(&jobs, &id, code);
                break;
            }
        }
    }
}

/// Every inbound line refreshes the heartbeat and records what kind of
/// activity it was (an event kind, `log`, or `stderr`).
fn heartbeat(jobs: &Arc<Mutex<HashMap<String, JobEntry>>>, id: &str, kind: &str) {
    let Ok(mut jobs) = jobs.lock() else { return };
    if let Some(entry) = jobs.get_mut(id) {
        entry.last_heartbeat = Instant::now();
        entry.last_event_kind = Some(kind.to_string());
    }
}

/// Exit-code classification: 0 → completed; nonzero while `stopping` →
/// cancelled; nonzero otherwise → failed. A state the watchdog already made
/// terminal is never overwritten.
fn classify_exit(jobs: &Arc<Mutex<HashMap<String, JobEntry>>>, id: &str, code: i32) {
    let Ok(mut jobs) = jobs.lock() else { return };
    let Some(entry) = jobs.get_mut(id) else { return };
    if entry.state.is_terminal() {
        entry.exit_code.get_or_insert(code);
        return;
    }
    entry.exit_code = Some(code);
    entry.state = if code == 0 {
        JobState::Completed
    } else if entry.state == JobState::Stopping {
        JobState::Cancelled
    } else {
        entry.failure_reason = Some(format!("exit_code_{}", code));
        JobState::Failed
    };
    info!(job_id = id, code, state = %entry.state, "Job exited");
}

/// Scan active jobs on a fixed interval; force-fail any whose heartbeat has
/// gone stale. The kill happens outside the lock, and the `failed` state is
/// set before it, so the watchdog's verdict wins over the exit message.
async fn watchdog_loop(jobs: Arc<Mutex<HashMap<String, JobEntry>>>, config: SupervisorConfig) {
    let mut tick = tokio::time::interval(config.watchdog_poll);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let stale: Vec<(String, ProcessRunner)> = {
            let Ok(mut jobs) = jobs.lock() else { continue };
            let mut stale = Vec::new();
            for (id, entry) in jobs.iter_mut() {
                if !matches!(entry.state, JobState::Starting | JobState::Running) {
                    continue;
                }
                if entry.last_heartbeat.elapsed() <= config.heartbeat_timeout {
                    continue;
                }
                entry.state = JobState::Failed;
                entry.failure_reason = Some("heartbeat_timeout".to_string());
                if let Some(runner) = entry.runner.clone() {
                    stale.push((id.clone(), runner));
                }
            }
            stale
        };
        for (id, runner) in stale {
            warn!(job_id = %id, "Heartbeat timeout; killing job");
            runner.kill().await;
        }
    }
}
