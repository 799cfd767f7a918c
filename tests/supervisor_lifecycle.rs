//! Job supervisor lifecycle tests against real `/bin/sh` child processes.

use std::time::Duration;

use tokio::sync::mpsc;

use tendersync::errors::SupervisorError;
use tendersync::events::{StampedEvent, WorkerEvent};
use tendersync::runner::SpawnSpec;
use tendersync::supervisor::{JobState, JobSupervisor, SupervisorConfig};

fn sh(script: &str) -> SpawnSpec {
    SpawnSpec::new("/bin/sh").args(["-c", script])
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        heartbeat_timeout: Duration::from_millis(400),
        watchdog_poll: Duration::from_millis(100),
        stop_grace: Duration::from_secs(2),
    }
}

async fn collect_events(mut rx: mpsc::UnboundedReceiver<StampedEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    while let Some(stamped) = rx.recv().await {
        events.push(stamped.event);
    }
    events
}

// ============================================================
// Happy path
// ============================================================

#[tokio::test]
async fn test_job_completes_with_ordered_events() {
    let supervisor = JobSupervisor::new(SupervisorConfig::default());
    let id = supervisor.create_job_id("scrape");
    let (tx, rx) = mpsc::unbounded_channel();

    let script = concat!(
        r#"echo '{"type":"start","portal":"demo"}'; "#,
        r#"echo '{"type":"progress","extracted":1,"skipped":0}'; "#,
        r#"echo '{"type":"completed","extracted":1,"skipped":0}'; "#,
        "exit 0"
    );
    supervisor.start_job(&id, sh(script), "demo", Some(tx)).unwrap();

    let job = supervisor.wait_for_terminal(&id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.exit_code, Some(0));
    assert!(job.failure_reason.is_none());
    assert_eq!(job.last_event_kind.as_deref(), Some("completed"));

    let events = collect_events(rx).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["start", "progress", "completed"]);

    // Terminal jobs stay queryable.
    assert_eq!(supervisor.get_job(&id).unwrap().state, JobState::Completed);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_nonzero_exit_is_failed() {
    let supervisor = JobSupervisor::new(SupervisorConfig::default());
    let id = supervisor.create_job_id("scrape");
    supervisor.start_job(&id, sh("exit 7"), "demo", None).unwrap();

    let job = supervisor.wait_for_terminal(&id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.exit_code, Some(7));
    assert_eq!(job.failure_reason.as_deref(), Some("exit_code_7"));
    supervisor.shutdown().await;
}

// ============================================================
// Stop semantics
// ============================================================

#[tokio::test]
async fn test_stopped_job_is_cancelled_not_failed() {
    let supervisor = JobSupervisor::new(SupervisorConfig::default());
    let id = supervisor.create_job_id("scrape");
    supervisor.start_job(&id, sh("sleep 30"), "demo", None).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.get_job(&id).unwrap().state, JobState::Running);

    supervisor.stop_job(&id, false, Duration::from_secs(5)).await.unwrap();
    let job = supervisor.wait_for_terminal(&id).await.unwrap();
    // Killed by signal while stopping: cancelled, never failed.
    assert_eq!(job.state, JobState::Cancelled);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_group_only_touches_its_group() {
    let supervisor = JobSupervisor::new(SupervisorConfig::default());
    let a = supervisor.create_job_id("a");
    let b = supervisor.create_job_id("b");
    supervisor.start_job(&a, sh("sleep 30"), "portal-a", None).unwrap();
    supervisor.start_job(&b, sh("sleep 30"), "portal-b", None).unwrap();

    let stopped = supervisor.stop_group("portal-a").await.unwrap();
    assert_eq!(stopped, 1);
    let job_a = supervisor.wait_for_terminal(&a).await.unwrap();
    assert_eq!(job_a.state, JobState::Cancelled);
    assert!(supervisor.get_job(&b).unwrap().state.is_active());

    supervisor.shutdown().await;
    let job_b = supervisor.wait_for_terminal(&b).await.unwrap();
    assert_eq!(job_b.state, JobState::Cancelled);
}

#[tokio::test]
async fn test_stop_unknown_job_errors() {
    let supervisor = JobSupervisor::new(SupervisorConfig::default());
    let err = supervisor
        .stop_job("no-such-job", false, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::JobNotFound { .. }));
    supervisor.shutdown().await;
}

// ============================================================
// Duplicate ids and spawn failures
// ============================================================

#[tokio::test]
async fn test_duplicate_live_id_is_rejected() {
    let supervisor = JobSupervisor::new(SupervisorConfig::default());
    let id = supervisor.create_job_id("scrape");
    supervisor.start_job(&id, sh("sleep 30"), "demo", None).unwrap();

    let err = supervisor
        .start_job(&id, sh("exit 0"), "demo", None)
        .unwrap_err();
    assert!(matches!(err, SupervisorError::JobAlreadyActive { .. }));

    supervisor.shutdown().await;
    supervisor.wait_for_terminal(&id).await.unwrap();

    // Once terminal, the id slot can be reused.
    supervisor.start_job(&id, sh("exit 0"), "demo", None).unwrap();
    let job = supervisor.wait_for_terminal(&id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn test_spawn_failure_leaves_no_job_behind() {
    let supervisor = JobSupervisor::new(SupervisorConfig::default());
    let err = supervisor
        .start_job(
            "bad",
            SpawnSpec::new("/no/such/binary-tendersync"),
            "demo",
            None,
        )
        .unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    assert!(supervisor.get_job("bad").is_none());
    supervisor.shutdown().await;
}

// ============================================================
// Watchdog
// ============================================================

#[tokio::test]
async fn test_watchdog_fails_silent_job() {
    let supervisor = JobSupervisor::new(fast_config());
    let id = supervisor.create_job_id("scrape");
    // Silent forever: never heartbeats.
    supervisor.start_job(&id, sh("sleep 30"), "demo", None).unwrap();

    let job = supervisor.wait_for_terminal(&id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("heartbeat_timeout"));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stderr_output_counts_as_heartbeat() {
    let supervisor = JobSupervisor::new(fast_config());
    let id = supervisor.create_job_id("scrape");
    // Chatters on stderr only, for longer than the heartbeat timeout.
    let script = "i=0; while [ $i -lt 8 ]; do echo tick >&2; sleep 0.15; i=$((i+1)); done; exit 0";
    supervisor.start_job(&id, sh(script), "demo", None).unwrap();

    let job = supervisor.wait_for_terminal(&id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    // Stderr activity is recorded as the last observed kind.
    assert_eq!(job.last_event_kind.as_deref(), Some("stderr"));
    supervisor.shutdown().await;
}
