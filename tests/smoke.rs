//! Smoke tests -- verify the binary runs and the config checker works.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn write_config(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("pingwarden")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("reachability and latency monitor"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("pingwarden")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("pingwarden"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["run", "check-config", "probe", "export", "models"] {
        Command::cargo_bin("pingwarden")
            .unwrap()
            .args([sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_check_config_lists_targets() {
    let cfg = write_config(
        r#"
[scheduler]
tick_interval_secs = 10

[[target]]
address = "192.0.2.10"

[[target]]
name = "edge-router"
address = "198.51.100.1"
kind = "tcp"
port = 443
interval_secs = 30
"#,
    );

    Command::cargo_bin("pingwarden")
        .unwrap()
        .env_remove("RUST_LOG")
        .args(["check-config", "--config"])
        .arg(cfg.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK: 2 target(s)"))
        .stdout(predicate::str::contains("192.0.2.10"))
        .stdout(predicate::str::contains("edge-router"));
}

#[test]
fn test_check_config_rejects_invalid_detector() {
    let cfg = write_config(
        r#"
[detector]
window_size = 4
min_fill = 9

[[target]]
address = "192.0.2.10"
"#,
    );

    Command::cargo_bin("pingwarden")
        .unwrap()
        .args(["check-config", "--config"])
        .arg(cfg.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("min_fill"));
}

#[test]
fn test_check_config_missing_file_fails() {
    Command::cargo_bin("pingwarden")
        .unwrap()
        .args(["check-config", "--config", "/nonexistent/pingwarden.toml"])
        .assert()
        .failure();
}

#[test]
fn test_export_empty_database_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("history.db");
    let cfg = write_config(&format!(
        "[storage]\ndb_path = \"{}\"\n\n[[target]]\naddress = \"192.0.2.10\"\n",
        db.display()
    ));

    Command::cargo_bin("pingwarden")
        .unwrap()
        .args(["export", "--config"])
        .arg(cfg.path())
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}
