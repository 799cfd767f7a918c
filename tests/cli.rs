//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn tendersync() -> Command {
    Command::cargo_bin("tendersync").unwrap()
}

#[test]
fn test_help_lists_commands() {
    tendersync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("scrape"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("repair"))
        .stdout(predicate::str::contains("housekeep"));
}

#[test]
fn test_status_on_fresh_project() {
    let dir = tempfile::tempdir().unwrap();
    tendersync()
        .args(["--project-dir", dir.path().to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded yet"));
}

#[test]
fn test_repair_on_clean_store() {
    let dir = tempfile::tempdir().unwrap();
    tendersync()
        .args(["--project-dir", dir.path().to_str().unwrap(), "repair"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to repair"));
}

#[test]
fn test_housekeep_with_no_stuck_runs() {
    let dir = tempfile::tempdir().unwrap();
    tendersync()
        .args(["--project-dir", dir.path().to_str().unwrap(), "housekeep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no stuck runs"));
}

#[test]
fn test_invalid_delta_mode_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    tendersync()
        .args([
            "--project-dir",
            dir.path().to_str().unwrap(),
            "scrape",
            "demo",
            "--delta-mode",
            "fast",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid delta mode"));
}
