//! End-to-end CLI tests for the seqdd binary.

// `Command::cargo_bin` is deprecated in assert_cmd >=2.0.17 in favor of
// `cargo::cargo_bin_cmd!` macro. Suppressed until migration to the new API.
#![allow(deprecated)]

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A `seqdd` invocation isolated in `dir`, ignoring the user's config.
fn seqdd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("seqdd").unwrap();
    cmd.current_dir(dir)
        .env("XDG_CONFIG_HOME", dir.join("xdg-config"))
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, contents: &str) {
    let config_dir = dir.join("xdg-config").join("seqdd");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("config.toml"), contents).unwrap();
}

#[test]
fn test_binary_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("--register-location"));
}

#[test]
fn test_binary_version_displays_version() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_init_twice_requires_force() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path()).arg("init").assert().success();
    assert!(dir.path().join(".register").is_dir());

    seqdd(dir.path())
        .arg("init")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
    seqdd(dir.path()).args(["init", "-f"]).assert().success();
}

#[test]
fn test_add_then_list() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path()).arg("init").assert().success();
    std::fs::write(dir.path().join("accs.txt"), "SRR000002\n\nSRR000003\n").unwrap();

    seqdd(dir.path())
        .args(["add", "-s", "sra", "-a", "SRR000001", "-f", "accs.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 added"));
    seqdd(dir.path())
        .args(["add", "-s", "url", "-a", "https://example.org/genome.fa.gz"])
        .assert()
        .success();

    seqdd(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout("sra\tSRR000001\nsra\tSRR000002\nsra\tSRR000003\nurl\thttps://example.org/genome.fa.gz\n");
    seqdd(dir.path())
        .args(["list", "-s", "sra", "--filter", "SRR00000[13]"])
        .assert()
        .success()
        .stdout("SRR000001\nSRR000003\n");
}

#[test]
fn test_add_invalid_accession_is_partial() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path()).arg("init").assert().success();
    seqdd(dir.path())
        .args(["add", "--offline", "-s", "ncbi", "-a", "GCF_000001405.40", "not-an-assembly"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("not-an-assembly"));
    seqdd(dir.path())
        .args(["list", "-s", "ncbi"])
        .assert()
        .stdout("GCF_000001405.40\n");
}

#[test]
fn test_commands_fail_without_register() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path())
        .args(["list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no register"));
}

#[test]
fn test_remove_reports_missing() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path()).arg("init").assert().success();
    seqdd(dir.path())
        .args(["add", "--offline", "-s", "logan", "-a", "SRR000001_unitigs"])
        .assert()
        .success();
    seqdd(dir.path())
        .args(["remove", "-s", "logan", "-a", "SRR000001_unitigs", "SRR000009"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 removed"))
        .stdout(predicate::str::contains("SRR000009"));
    assert!(!dir.path().join(".register/logan.txt").exists());
}

#[test]
fn test_export_import_across_registers() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path()).arg("init").assert().success();
    seqdd(dir.path())
        .args(["add", "--offline", "-s", "ena", "-a", "ERR000001", "SRR000001"])
        .assert()
        .success();
    seqdd(dir.path()).args(["export", "shared.txt"]).assert().success();
    let exported = std::fs::read_to_string(dir.path().join("shared.txt")).unwrap();
    assert_eq!(exported, "version 0.0\nena\t2\nERR000001\nSRR000001\n");

    seqdd(dir.path())
        .args(["--register-location", "other", "init"])
        .assert()
        .success();
    seqdd(dir.path())
        .args(["--register-location", "other", "import", "shared.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 2"));
    seqdd(dir.path())
        .args(["list", "--register-location", "other", "-s", "ena"])
        .assert()
        .stdout("ERR000001\nSRR000001\n");
}

#[test]
fn test_config_register_location_is_used() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "register_location = \"from-config\"\n");
    seqdd(dir.path()).arg("init").assert().success();
    assert!(dir.path().join("from-config").is_dir());
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "max_processes = 0\n");
    seqdd(dir.path())
        .arg("list")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("max_processes"));
}

#[test]
fn test_download_empty_register_succeeds() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path()).arg("init").assert().success();
    seqdd(dir.path())
        .args(["-q", "download"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to download"));
}

#[test]
fn test_download_failure_writes_json_report() {
    let dir = TempDir::new().unwrap();
    seqdd(dir.path()).arg("init").assert().success();
    // Port 9 (discard) refuses connections on any sane test host.
    seqdd(dir.path())
        .args(["add", "-s", "url", "-a", "http://127.0.0.1:9/missing.fa"])
        .assert()
        .success();

    seqdd(dir.path())
        .args(["-q", "download", "-p", "1", "--json-report", "report.json"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("0 succeeded, 1 failed"));
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap())
            .unwrap();
    assert_eq!(report["failed"][0], "http://127.0.0.1:9/missing.fa");
    assert!(dir.path().join("data").is_dir());
    assert!(dir.path().join("logs").is_dir());
}
