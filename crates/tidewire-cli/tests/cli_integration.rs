//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end, including
//! a real host started with `tidewire serve`.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command as StdCommand, Stdio};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

fn cli_cmd() -> Command {
    Command::cargo_bin("tidewire").expect("Failed to find tidewire binary")
}

const WIDGET_CONFIG: &str = r#"{
    "name": "cli-test",
    "schemas": [{
        "name": "Widget",
        "flags": { "cached": true },
        "properties": [
            { "name": "id", "tag": 1, "kind": "uint", "key": true },
            { "name": "color", "tag": 2, "kind": "string" }
        ]
    }]
}"#;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("tidewire.json");
    std::fs::write(&path, contents).unwrap();
    path
}

/// Host process killed on drop
struct RunningHost {
    child: Child,
    addr: String,
}

impl Drop for RunningHost {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Start `tidewire serve` on an ephemeral port and read back its address
fn start_host(config: &Path) -> RunningHost {
    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin("tidewire"))
        .arg("serve")
        .arg("--config")
        .arg(config)
        .arg("--listen")
        .arg("127.0.0.1:0")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start host");

    let stdout = child.stdout.take().unwrap();
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).unwrap();
    let addr = line
        .trim()
        .rsplit(' ')
        .next()
        .expect("listening line carries the address")
        .to_string();
    RunningHost { child, addr }
}

// ============================================================================
// Argument Handling
// ============================================================================

#[test]
fn test_help_lists_commands() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("watch"))
        .stdout(predicate::str::contains("publish"))
        .stdout(predicate::str::contains("schemas"));
}

#[test]
fn test_watch_requires_groups() {
    cli_cmd()
        .args(["watch", "127.0.0.1:1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_serve_with_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    cli_cmd()
        .arg("serve")
        .arg("--config")
        .arg(dir.path().join("missing.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn test_serve_with_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, r#"{ "sweep_interval_ms": 0 }"#);
    cli_cmd()
        .arg("serve")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("sweep_interval_ms"));
}

#[test]
fn test_publish_rejects_invalid_json() {
    cli_cmd()
        .args(["publish", "127.0.0.1:1", "Widget", "{not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("valid JSON"));
}

// ============================================================================
// Against a Running Host
// ============================================================================

#[test]
fn test_schemas_lists_configured_types() {
    let dir = TempDir::new().unwrap();
    let host = start_host(&write_config(&dir, WIDGET_CONFIG));

    cli_cmd()
        .args(["schemas", &host.addr])
        .assert()
        .success()
        .stdout(predicate::str::contains("Widget [C....]"))
        .stdout(predicate::str::contains("id (key)"))
        // internal types are not discoverable
        .stdout(predicate::str::contains("PeerState").not());
}

#[test]
fn test_schemas_json_with_filter() {
    let dir = TempDir::new().unwrap();
    let host = start_host(&write_config(&dir, WIDGET_CONFIG));

    cli_cmd()
        .args(["schemas", &host.addr, "--exclude", "Widget", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_publish_known_type() {
    let dir = TempDir::new().unwrap();
    let host = start_host(&write_config(&dir, WIDGET_CONFIG));

    cli_cmd()
        .args(["publish", &host.addr, "Widget", r#"{"id": 1, "color": "red"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("published Widget"));

    cli_cmd()
        .args(["publish", &host.addr, "Widget", r#"{"id": 1}"#, "--remove"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed Widget"));
}

#[test]
fn test_publish_unknown_type_fails() {
    let dir = TempDir::new().unwrap();
    let host = start_host(&write_config(&dir, WIDGET_CONFIG));

    cli_cmd()
        .args(["publish", &host.addr, "Gadget", r#"{"id": 1}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not know type 'Gadget'"));
}
