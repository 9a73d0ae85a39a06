//! Smoke tests -- verify the binary runs and the read-only commands work.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

const CONFIG: &str = r#"
[services.web]
[[services.web.checks]]
name = "homepage"
cmd = "wget -q -O- http://web/"
interval = "30s"

[[services.web.checks]]
name = "latency"
cmd = "echo 12"
type = "metric"
unit = "ms"
"#;

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("patrol.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("patrol")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Container-backed health checks"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("patrol")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("patrol"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["run", "validate", "status", "history"] {
        Command::cargo_bin("patrol")
            .unwrap()
            .args([sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_validate_lists_checks() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);

    Command::cargo_bin("patrol")
        .unwrap()
        .args(["validate", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("homepage"))
        .stdout(predicate::str::contains("metric"))
        .stdout(predicate::str::contains("2 checks OK"));
}

#[test]
fn test_validate_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[services.web]
[[services.web.checks]]
name = "homepage"
interval = "soon"
"#,
    );

    Command::cargo_bin("patrol")
        .unwrap()
        .args(["validate", "--config"])
        .arg(&config)
        .assert()
        .failure();
}

#[test]
fn test_status_without_history_is_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);

    Command::cargo_bin("patrol")
        .unwrap()
        .args(["status", "--json", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""overall": "inprogress""#));

    // The default database lands next to the config file.
    assert!(dir.path().join("patrol.db").exists());
}

#[test]
fn test_history_of_unknown_check_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);

    Command::cargo_bin("patrol")
        .unwrap()
        .args(["history", "--service", "web", "--check", "homepage", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("No history for web/homepage."));
}
