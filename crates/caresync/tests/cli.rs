//! End-to-end tests of the caresync binary against a temporary data dir

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::{tempdir, TempDir};

fn caresync(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("caresync").unwrap();
    cmd.arg("--data-dir")
        .arg(dir.path())
        .env_remove("CARESYNC_HOME")
        .env_remove("CARESYNC_TENANT")
        .env_remove("CARESYNC_USER")
        .env_remove("RUST_LOG");
    cmd
}

fn as_nurse(dir: &TempDir) -> Command {
    let mut cmd = caresync(dir);
    cmd.args(["--tenant", "care-home-1", "--user", "nurse-1"]);
    cmd
}

fn json_data(cmd: &mut Command) -> Value {
    let output = cmd.arg("--json").output().unwrap();
    assert!(output.status.success(), "command failed: {:?}", output);
    let response: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["ok"], true);
    response["data"].clone()
}

fn initialised() -> TempDir {
    let dir = tempdir().unwrap();
    caresync(&dir).arg("init").assert().success();
    dir
}

#[test]
fn test_init_is_idempotent() {
    let dir = tempdir().unwrap();
    let first = json_data(caresync(&dir).args(["init", "--label", "ward-a"]));
    assert_eq!(first["created"], true);

    let second = json_data(caresync(&dir).args(["init", "--endpoint", "http://127.0.0.1:9"]));
    assert_eq!(second["created"], false);
    assert_eq!(second["device_id"], first["device_id"]);
    assert_eq!(second["endpoint"], "http://127.0.0.1:9");
}

#[test]
fn test_commands_require_init() {
    let dir = tempdir().unwrap();
    as_nurse(&dir)
        .arg("pending")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("caresync init"));
}

#[test]
fn test_write_requires_actor() {
    let dir = initialised();
    caresync(&dir)
        .args(["write", "medications", "--payload", "{}"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--tenant"));
}

#[test]
fn test_write_then_read_and_list() {
    let dir = initialised();
    let written = json_data(as_nurse(&dir).args([
        "write",
        "medications",
        "--id",
        "m1",
        "--payload",
        r#"{"drug":"paracetamol","dose_mg":500}"#,
    ]));
    assert_eq!(written["change_id"], 1);
    assert_eq!(written["record_id"], "m1");

    let record = json_data(as_nurse(&dir).args(["get", "medications", "m1"]));
    assert_eq!(record["payload"]["dose_mg"], 500);
    assert_eq!(record["user_id"], "nurse-1");

    let listed = json_data(as_nurse(&dir).args(["list", "medications", "--by-user", "nurse-1"]));
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let pending = json_data(as_nurse(&dir).arg("pending"));
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(pending[0]["action"], "create");
}

#[test]
fn test_other_tenant_sees_nothing() {
    let dir = initialised();
    as_nurse(&dir)
        .args(["write", "care_notes", "--id", "n1", "--payload", r#"{"text":"ok"}"#])
        .assert()
        .success();

    caresync(&dir)
        .args(["--tenant", "care-home-2", "--user", "nurse-9", "get", "care_notes", "n1"])
        .assert()
        .code(3);
    let pending = json_data(caresync(&dir).args(["--tenant", "care-home-2", "pending"]));
    assert!(pending.as_array().unwrap().is_empty());
}

#[test]
fn test_invalid_payload_is_rejected() {
    let dir = initialised();
    as_nurse(&dir)
        .args(["write", "medications", "--payload", "{dose"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not valid JSON"));
}

#[test]
fn test_delete_requires_id() {
    let dir = initialised();
    as_nurse(&dir)
        .args(["write", "medications", "--action", "delete"])
        .assert()
        .code(2);
}

#[test]
fn test_sync_without_endpoint_fails() {
    let dir = initialised();
    as_nurse(&dir)
        .arg("sync")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("endpoint"));
}

#[test]
fn test_audit_records_writes_and_verifies() {
    let dir = initialised();
    as_nurse(&dir)
        .args(["write", "schedules", "--id", "s1", "--payload", r#"{"at":"08:00"}"#])
        .assert()
        .success();

    let entries = json_data(as_nurse(&dir).args(["audit", "query", "--action", "record.write"]));
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["user_id"], "nurse-1");
    assert_eq!(entries[0]["details"]["record_id"], "s1");
    assert_eq!(entries[0]["hash"].as_str().unwrap().len(), 64);

    let report = json_data(caresync(&dir).args(["audit", "verify"]));
    assert_eq!(report["intact"], true);
    assert_eq!(report["entries_checked"], 1);
}

#[test]
fn test_status_and_stats() {
    let dir = initialised();
    as_nurse(&dir)
        .args(["write", "templates", "--payload", r#"{"name":"morning"}"#])
        .assert()
        .success();

    let status = json_data(caresync(&dir).args(["--tenant", "care-home-1", "status"]));
    assert_eq!(status["mode"], "offline_capable");
    assert_eq!(status["pending"], 1);
    assert_eq!(status["conflicts"], 0);

    let stats = json_data(caresync(&dir).args(["db", "stats"]));
    assert_eq!(stats["record_count"], 1);
    assert_eq!(stats["pending_count"], 1);
}

#[test]
fn test_resolve_unknown_conflict_fails() {
    let dir = initialised();
    let conflicts = json_data(as_nurse(&dir).args(["conflict", "list"]));
    assert!(conflicts.as_array().unwrap().is_empty());

    as_nurse(&dir)
        .args(["conflict", "resolve", "42"])
        .assert()
        .code(4);
}
