//! CLI smoke tests for gridadmin.
//!
//! Every test runs against its own registry directory.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

/// Get path to a fixture file.
fn fixture_path(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Get a Command for the gridadmin binary bound to the registry in `temp`.
fn gridadmin(temp: &TempDir) -> Command {
  let mut cmd = cargo_bin_cmd!("gridadmin");
  cmd.arg("--registry").arg(temp.path().join("registry"));
  cmd.env_remove("GRIDADMIN_REGISTRY");
  cmd.env_remove("GRIDADMIN_INIT_TIMEOUT");
  cmd.env_remove("GRIDADMIN_KEEP_ALIVE");
  cmd.env("GRIDADMIN_CLIENT", "smoke-test");
  cmd.env("RUST_LOG", "warn");
  cmd
}

/// A registry holding the `demo` fixture.
fn imported() -> TempDir {
  let temp = TempDir::new().unwrap();
  gridadmin(&temp)
    .arg("import")
    .arg(fixture_path("demo.json"))
    .assert()
    .success();
  temp
}

fn status_json(temp: &TempDir) -> serde_json::Value {
  let output = gridadmin(temp).args(["status", "--json"]).output().unwrap();
  assert!(output.status.success());
  serde_json::from_slice(&output.stdout).unwrap()
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  cargo_bin_cmd!("gridadmin")
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  cargo_bin_cmd!("gridadmin")
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("gridadmin"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["import", "tree", "status", "resolve", "set-property", "remove-server"] {
    cargo_bin_cmd!("gridadmin")
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// status / tree
// =============================================================================

#[test]
#[serial]
fn status_on_empty_registry() {
  let temp = TempDir::new().unwrap();

  gridadmin(&temp)
    .arg("status")
    .assert()
    .success()
    .stdout(predicate::str::contains("Serial"))
    .stdout(predicate::str::contains("Applications: 0"));
}

#[test]
#[serial]
fn tree_on_empty_registry() {
  let temp = TempDir::new().unwrap();

  gridadmin(&temp)
    .arg("tree")
    .assert()
    .success()
    .stdout(predicate::str::contains("No applications deployed"));
}

#[test]
#[serial]
fn malformed_keep_alive_is_rejected() {
  let temp = TempDir::new().unwrap();

  gridadmin(&temp)
    .arg("status")
    .env("GRIDADMIN_KEEP_ALIVE", "soon")
    .assert()
    .failure()
    .stderr(predicate::str::contains("GRIDADMIN_KEEP_ALIVE"));
}

// =============================================================================
// import
// =============================================================================

#[test]
#[serial]
fn import_adds_the_application() {
  let temp = imported();

  let status = status_json(&temp);
  assert_eq!(status["serial"], 1);
  assert_eq!(status["applications"], serde_json::json!(["demo"]));

  gridadmin(&temp)
    .arg("tree")
    .assert()
    .success()
    .stdout(predicate::str::contains("demo"))
    .stdout(predicate::str::contains("S1"))
    .stdout(predicate::str::contains("db"));
}

#[test]
#[serial]
fn importing_twice_fails() {
  let temp = imported();

  gridadmin(&temp)
    .arg("import")
    .arg(fixture_path("demo.json"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("already exists"));
  assert_eq!(status_json(&temp)["serial"], 1);
}

#[test]
#[serial]
fn import_rejects_malformed_json() {
  let temp = TempDir::new().unwrap();
  let file = temp.path().join("broken.json");
  std::fs::write(&file, "{ not json").unwrap();

  gridadmin(&temp)
    .arg("import")
    .arg(&file)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to parse"));
}

#[test]
#[serial]
fn tree_json_lists_applications() {
  let temp = imported();

  let output = gridadmin(&temp).args(["tree", "--json"]).output().unwrap();
  assert!(output.status.success());
  let tree: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(tree[0]["id"], "demo");
  assert_eq!(tree[0]["modified"], false);
}

// =============================================================================
// resolve
// =============================================================================

#[test]
#[serial]
fn resolve_uses_the_server_scope() {
  let temp = imported();

  gridadmin(&temp)
    .args(["resolve", "demo", "N1", "S1", "${server} on ${node} port ${port} (${env})"])
    .assert()
    .success()
    .stdout("S1 on N1 port 9000 (test)\n");
}

#[test]
#[serial]
fn resolve_unknown_server_fails() {
  let temp = imported();

  gridadmin(&temp)
    .args(["resolve", "demo", "N1", "nope", "${server}"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("not found"));
}

// =============================================================================
// set-property / remove-server
// =============================================================================

#[test]
#[serial]
fn set_property_updates_every_instance() {
  let temp = imported();

  gridadmin(&temp)
    .args(["set-property", "demo", "T", "Ice.Trace", "${port}"])
    .assert()
    .success()
    .stdout(predicate::str::contains("2 location(s) rebuilt"));

  assert_eq!(status_json(&temp)["serial"], 2);
  let stored = std::fs::read_to_string(temp.path().join("registry").join("registry.json")).unwrap();
  assert!(stored.contains("Ice.Trace"));
}

#[test]
#[serial]
fn set_property_to_the_current_value_saves_nothing() {
  let temp = imported();
  gridadmin(&temp)
    .args(["set-property", "demo", "T", "Ice.Trace", "1"])
    .assert()
    .success();

  gridadmin(&temp)
    .args(["set-property", "demo", "T", "Ice.Trace", "1"])
    .assert()
    .success()
    .stdout(predicate::str::contains("already has Ice.Trace=1"));

  assert_eq!(status_json(&temp)["serial"], 2);
}

#[test]
#[serial]
fn set_property_on_unknown_template_fails() {
  let temp = imported();

  gridadmin(&temp)
    .args(["set-property", "demo", "missing", "Ice.Trace", "1"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("does not exist"));
  assert_eq!(status_json(&temp)["serial"], 1);
}

#[test]
#[serial]
fn remove_server_saves_the_removal() {
  let temp = imported();

  gridadmin(&temp)
    .args(["remove-server", "demo", "N1", "db"])
    .assert()
    .success()
    .stdout(predicate::str::contains("serial 2"));

  gridadmin(&temp)
    .args(["resolve", "demo", "N1", "db", "${server}"])
    .assert()
    .failure();
  gridadmin(&temp)
    .args(["resolve", "demo", "N1", "S1", "${server}"])
    .assert()
    .success();
}
