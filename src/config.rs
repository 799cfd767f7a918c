//! Runtime configuration.
//!
//! All state lives under `<project_dir>/.tendersync/`; optional overrides
//! come from `tendersync.toml` in the project directory and, for the worker
//! command, from the `TENDERSYNC_WORKER_CMD` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::supervisor::SupervisorConfig;

pub const CONFIG_FILE: &str = "tendersync.toml";
pub const STATE_DIR: &str = ".tendersync";

const DEFAULT_WORKER_CMD: &str = "tendersync-worker";
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 180;
const DEFAULT_WATCHDOG_POLL_SECS: u64 = 5;
const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_STALE_RUN_HOURS: i64 = 24;
const DEFAULT_DEPT_WORKERS: usize = 4;

/// On-disk shape of `tendersync.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub worker_cmd: Option<String>,
    pub db_path: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub watchdog_poll_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
    pub stale_run_hours: Option<i64>,
    pub dept_workers: Option<usize>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub manifest_path: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub worker_cmd: String,
    pub heartbeat_timeout: Duration,
    pub watchdog_poll: Duration,
    pub stop_grace: Duration,
    pub stale_run_age: chrono::Duration,
    pub dept_workers: usize,
    pub verbose: bool,
}

impl Config {
    /// Resolve configuration for a project directory: file values first,
    /// then environment, then defaults.
    pub fn load(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let file = Self::read_config_file(&project_dir)?;

        let state_dir = match file.state_dir {
            Some(ref dir) if dir.is_absolute() => dir.clone(),
            Some(ref dir) => project_dir.join(dir),
            None => project_dir.join(STATE_DIR),
        };
        let db_path = match file.db_path {
            Some(ref path) if path.is_absolute() => path.clone(),
            Some(ref path) => project_dir.join(path),
            None => state_dir.join("tendersync.db"),
        };

        let worker_cmd = std::env::var("TENDERSYNC_WORKER_CMD")
            .ok()
            .or(file.worker_cmd)
            .unwrap_or_else(|| DEFAULT_WORKER_CMD.to_string());

        Ok(Self {
            manifest_path: state_dir.join("manifest.json"),
            checkpoints_dir: state_dir.join("checkpoints"),
            snapshots_dir: state_dir.join("snapshots"),
            project_dir,
            state_dir,
            db_path,
            worker_cmd,
            heartbeat_timeout: Duration::from_secs(
                file.heartbeat_timeout_secs
                    .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            ),
            watchdog_poll: Duration::from_secs(
                file.watchdog_poll_secs.unwrap_or(DEFAULT_WATCHDOG_POLL_SECS),
            ),
            stop_grace: Duration::from_secs(
                file.stop_grace_secs.unwrap_or(DEFAULT_STOP_GRACE_SECS),
            ),
            stale_run_age: chrono::Duration::hours(
                file.stale_run_hours.unwrap_or(DEFAULT_STALE_RUN_HOURS),
            ),
            dept_workers: file.dept_workers.unwrap_or(DEFAULT_DEPT_WORKERS),
            verbose,
        })
    }

    fn read_config_file(project_dir: &std::path::Path) -> Result<ConfigFile> {
        let path = project_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(ConfigFile::default());
        }
        debug!(path = %path.display(), "Loading config file");
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Create the state directory tree.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.state_dir, &self.checkpoints_dir, &self.snapshots_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Supervisor settings derived from this config, with the heartbeat
    /// floor applied.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_timeout: self.heartbeat_timeout,
            watchdog_poll: self.watchdog_poll,
            stop_grace: self.stop_grace,
        }
        .normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();

        assert_eq!(config.state_dir, config.project_dir.join(".tendersync"));
        assert_eq!(config.db_path, config.state_dir.join("tendersync.db"));
        assert_eq!(config.manifest_path, config.state_dir.join("manifest.json"));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(180));
        assert_eq!(config.stale_run_age, chrono::Duration::hours(24));
        assert_eq!(config.dept_workers, 4);
    }

    #[test]
    fn test_config_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
worker_cmd = "python3 scraper.py"
heartbeat_timeout_secs = 300
stale_run_hours = 6
dept_workers = 2
"#,
        )
        .unwrap();

        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.worker_cmd, "python3 scraper.py");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        assert_eq!(config.stale_run_age, chrono::Duration::hours(6));
        assert_eq!(config.dept_workers, 2);
    }

    #[test]
    fn test_relative_state_dir_resolves_under_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "state_dir = \"var/sync\"\n").unwrap();

        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.state_dir, config.project_dir.join("var/sync"));
    }

    #[test]
    fn test_malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "worker_cmd = [not toml").unwrap();
        assert!(Config::load(dir.path().to_path_buf(), false).is_err());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.checkpoints_dir.is_dir());
        assert!(config.snapshots_dir.is_dir());
    }
}
