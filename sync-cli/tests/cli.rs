//! End-to-end runs of the `pictor` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::tempdir;

fn pictor(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pictor").unwrap();
    cmd.arg("--data-dir").arg(data_dir).env("RUST_LOG", "warn");
    cmd
}

fn created_uuid(output: &[u8]) -> String {
    String::from_utf8(output.to_vec()).unwrap().trim().to_string()
}

#[test]
fn help_lists_commands() {
    Command::cargo_bin("pictor")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("add-flight-plan"))
        .stdout(predicate::str::contains("sync"));
}

#[test]
fn commands_require_init() {
    let dir = tempdir().unwrap();
    pictor(dir.path())
        .args(["add-project", "site"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("pictor init"));

    pictor(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("NOT INITIALIZED"));
}

#[test]
fn init_twice_fails() {
    let dir = tempdir().unwrap();
    pictor(dir.path())
        .args(["init", "--device-id", "tablet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tablet"));
    pictor(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Already initialized"));
}

#[test]
fn anonymous_data_stays_local_until_login() {
    let dir = tempdir().unwrap();
    pictor(dir.path()).arg("init").assert().success();

    let out = pictor(dir.path())
        .args(["add-project", "Facade survey"])
        .assert()
        .success();
    let project = created_uuid(&out.get_output().stdout);

    pictor(dir.path())
        .args(["add-flight-plan", "--project", &project, "North face"])
        .assert()
        .success();

    pictor(dir.path())
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sync skipped"));

    pictor(dir.path())
        .args(["login", "--name", "Pilot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Logged in as Pilot"));

    pictor(dir.path())
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sync completed"));

    pictor(dir.path())
        .args(["list", "flight_plan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("North face"))
        .stdout(predicate::str::contains("  synced "));
}

#[test]
fn delete_hides_records_from_list() {
    let dir = tempdir().unwrap();
    pictor(dir.path()).arg("init").assert().success();
    let out = pictor(dir.path())
        .args(["add-flight", "Morning"])
        .assert()
        .success();
    let flight = created_uuid(&out.get_output().stdout);

    pictor(dir.path())
        .args(["delete", &flight])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted"));

    pictor(dir.path())
        .args(["list", "flight"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No flight records"));
    pictor(dir.path())
        .args(["list", "flight", "--deleted"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[deleted]"));
}

#[test]
fn unknown_kind_is_rejected() {
    let dir = tempdir().unwrap();
    pictor(dir.path()).arg("init").assert().success();
    pictor(dir.path())
        .args(["list", "waypoint"])
        .assert()
        .failure();
}

#[test]
fn shared_cloud_file_syncs_two_devices() {
    let root = tempdir().unwrap();
    let cloud = root.path().join("cloud.json");
    let a = root.path().join("a");
    let b = root.path().join("b");
    let account = "0b6f2a52-7c53-4c1e-9d59-6a1f0d1c2b3a";

    for dir in [&a, &b] {
        pictor(dir).arg("--cloud").arg(&cloud).arg("init").assert().success();
        pictor(dir)
            .arg("--cloud")
            .arg(&cloud)
            .args(["login", "--name", "Pilot", "--uuid", account])
            .assert()
            .success();
    }

    pictor(&a)
        .arg("--cloud")
        .arg(&cloud)
        .args(["add-project", "Bridge"])
        .assert()
        .success();
    pictor(&a).arg("--cloud").arg(&cloud).arg("sync").assert().success();
    pictor(&b).arg("--cloud").arg(&cloud).arg("sync").assert().success();

    pictor(&b)
        .args(["list", "project"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Bridge"));

    pictor(&b)
        .arg("purge")
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged 0"));
}
