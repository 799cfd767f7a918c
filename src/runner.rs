//! Process runner: owns one OS worker process from spawn to exit and turns
//! its raw output into typed messages.
//!
//! Three reader tasks run per process (stdout lines, stderr lines, exit
//! waiter), plus an optional fourth that tails a log file for workers whose
//! primary channel is a file rather than stdout. All of them feed a single
//! mpsc channel; the exit notification is sent exactly once, after both
//! pipes have drained, regardless of how the process died.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::events::{OutputLine, StampedEvent, classify_line};

/// How often the log-file tail checks for appended content.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Log file to tail in addition to the stdio pipes.
    pub log_file: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }
}

/// Typed output of one supervised process.
#[derive(Debug, Clone)]
pub enum RunnerMessage {
    /// A structured event parsed from stdout or the tailed log file.
    Event(StampedEvent),
    /// A plain stdout (or log file) line.
    Log(String),
    /// A stderr line.
    ErrLine(String),
    /// The process exited with this code. Sent exactly once, last.
    Exited(i32),
}

/// Handle to a spawned process. Cheap to clone; the child itself is owned
/// by the exit-waiter task, so termination goes through signals by pid.
#[derive(Clone)]
pub struct ProcessRunner {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
}

impl ProcessRunner {
    /// Spawn the process and its reader tasks. Must be called from within a
    /// tokio runtime. Fails only if the OS spawn itself fails.
    pub fn spawn(
        spec: &SpawnSpec,
        tx: mpsc::UnboundedSender<RunnerMessage>,
    ) -> std::io::Result<ProcessRunner> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        debug!(pid, command = %spec.command, "Spawned worker process");

        let (exit_tx, exit_rx) = watch::channel::<Option<i32>>(None);

        // Stdout: structured events or log lines.
        let stdout = child.stdout.take();
        let stdout_tx = tx.clone();
        let stdout_task = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match classify_line(&line) {
                    Some(OutputLine::Event(event)) => {
                        let _ = stdout_tx.send(RunnerMessage::Event(event));
                    }
                    Some(OutputLine::Log(text)) => {
                        let _ = stdout_tx.send(RunnerMessage::Log(text));
                    }
                    None => {}
                }
            }
        });

        // Stderr: every non-empty line is an error line.
        let stderr = child.stderr.take();
        let stderr_tx = tx.clone();
        let stderr_task = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    let _ = stderr_tx.send(RunnerMessage::ErrLine(line));
                }
            }
        });

        // Optional log-file tail.
        let tail_task = spec.log_file.clone().map(|path| {
            let tail_tx = tx.clone();
            let mut tail_exit = exit_rx.clone();
            tokio::spawn(async move {
                tail_log_file(path, tail_tx, &mut tail_exit).await;
            })
        });

        // Exit waiter: owns the child, reports the code once after both
        // pipes have drained.
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(pid, error = %e, "Error waiting for worker process");
                    -1
                }
            };
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = exit_tx.send(Some(code));
            if let Some(tail) = tail_task {
                let _ = tail.await;
            }
            let _ = tx.send(RunnerMessage::Exited(code));
        });

        Ok(ProcessRunner { pid, exit: exit_rx })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// The exit code, if the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Request graceful termination (SIGTERM), wait up to `timeout` for the
    /// process to exit, then force-kill. Returns once the process is gone.
    pub async fn stop(&self, timeout: Duration) {
        if self.has_exited() {
            return;
        }
        self.signal(libc::SIGTERM);
        let mut rx = self.exit.clone();
        let graceful = tokio::time::timeout(timeout, rx.wait_for(|c| c.is_some()))
            .await
            .is_ok();
        if graceful {
            return;
        }
        debug!(pid = self.pid, "Graceful stop timed out; escalating to SIGKILL");
        self.kill().await;
    }

    /// Force termination (SIGKILL) and wait for the exit to be observed.
    pub async fn kill(&self) {
        if self.has_exited() {
            return;
        }
        self.signal(libc::SIGKILL);
        let mut rx = self.exit.clone();
        let _ = rx.wait_for(|c| c.is_some()).await;
    }

    /// Wait for the process to exit naturally; returns the exit code.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit.clone();
        match rx.wait_for(|c| c.is_some()).await {
            Ok(code) => (*code).unwrap_or(-1),
            Err(_) => self.exit_code().unwrap_or(-1),
        }
    }

    fn signal(&self, sig: i32) {
        if self.pid == 0 {
            return;
        }
        unsafe {
            libc::kill(self.pid as i32, sig);
        }
    }
}

/// Poll a worker's log file for appended lines, classifying them exactly
/// like stdout. Complete lines only; the unterminated tail is held back
/// until the next poll, with a final drain after the process exits.
async fn tail_log_file(
    path: PathBuf,
    tx: mpsc::UnboundedSender<RunnerMessage>,
    exit: &mut watch::Receiver<Option<i32>>,
) {
    let mut offset: usize = 0;
    loop {
        let exited = exit.borrow().is_some();
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            // Truncated/rotated file: start over.
            if content.len() < offset {
                offset = 0;
            }
            let new = &content[offset..];
            let consumed = if exited {
                new.len()
            } else {
                new.rfind('\n').map(|i| i + 1).unwrap_or(0)
            };
            for line in new[..consumed].lines() {
                match classify_line(line) {
                    Some(OutputLine::Event(event)) => {
                        let _ = tx.send(RunnerMessage::Event(event));
                    }
                    Some(OutputLine::Log(text)) => {
                        let _ = tx.send(RunnerMessage::Log(text));
                    }
                    None => {}
                }
            }
            offset += consumed;
        }
        if exited {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
            _ = exit.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WorkerEvent;

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec::new("/bin/sh").args(["-c", script])
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<RunnerMessage>) -> Vec<RunnerMessage> {
        let mut messages = Vec::new();
        while let Some(msg) = rx.recv().await {
            let done = matches!(msg, RunnerMessage::Exited(_));
            messages.push(msg);
            if done {
                break;
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_stdout_lines_are_classified() {
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = sh(r#"echo '{"type":"start","portal":"etenders"}'; echo plain line; exit 0"#);
        ProcessRunner::spawn(&spec, tx).unwrap();

        let messages = drain(rx).await;
        assert!(matches!(
            &messages[0],
            RunnerMessage::Event(e) if e.event == WorkerEvent::Start { portal: "etenders".into() }
        ));
        assert!(matches!(&messages[1], RunnerMessage::Log(l) if l == "plain line"));
        assert!(matches!(messages.last(), Some(RunnerMessage::Exited(0))));
    }

    #[tokio::test]
    async fn test_stderr_lines_and_exit_code() {
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = sh("echo oops >&2; exit 3");
        ProcessRunner::spawn(&spec, tx).unwrap();

        let messages = drain(rx).await;
        assert!(
            messages
                .iter()
                .any(|m| matches!(m, RunnerMessage::ErrLine(l) if l == "oops"))
        );
        assert!(matches!(messages.last(), Some(RunnerMessage::Exited(3))));
    }

    #[tokio::test]
    async fn test_exit_message_is_last_and_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = sh("echo one; echo two; exit 0");
        ProcessRunner::spawn(&spec, tx).unwrap();

        let messages = drain(rx).await;
        let exits = messages
            .iter()
            .filter(|m| matches!(m, RunnerMessage::Exited(_)))
            .count();
        assert_eq!(exits, 1);
        assert!(matches!(messages.last(), Some(RunnerMessage::Exited(0))));
        // Stream order is preserved.
        let logs: Vec<&str> = messages
            .iter()
            .filter_map(|m| match m {
                RunnerMessage::Log(l) => Some(l.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(logs, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_graceful_stop_terminates_process() {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = ProcessRunner::spawn(&sh("sleep 30"), tx).unwrap();
        assert!(!runner.has_exited());

        runner.stop(Duration::from_secs(5)).await;
        assert!(runner.has_exited());
        // Killed by signal: reported as -1.
        let messages = drain(rx).await;
        assert!(matches!(messages.last(), Some(RunnerMessage::Exited(-1))));
    }

    #[tokio::test]
    async fn test_log_file_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("worker.log");
        let (tx, rx) = mpsc::unbounded_channel();
        let script = format!(
            r#"echo '{{"type":"status","message":"from log"}}' > {p}; sleep 1; echo done >> {p}"#,
            p = log_path.display()
        );
        let spec = sh(&script).log_file(log_path.clone());
        ProcessRunner::spawn(&spec, tx).unwrap();

        let messages = drain(rx).await;
        assert!(messages.iter().any(|m| matches!(
            m,
            RunnerMessage::Event(e) if e.event == WorkerEvent::Status { message: "from log".into() }
        )));
        assert!(
            messages
                .iter()
                .any(|m| matches!(m, RunnerMessage::Log(l) if l == "done"))
        );
    }
}
