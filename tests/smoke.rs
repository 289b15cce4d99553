//! Smoke tests -- verify the binary runs and the offline subcommands work.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn auditrun() -> Command {
    let mut cmd = Command::cargo_bin("auditrun").unwrap();
    cmd.env_remove("AUDITRUN_CONFIG").env("RUST_LOG", "off");
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("auditrun.toml");
    let db = dir.join("engine.db");
    std::fs::write(
        &path,
        format!(
            "[server]\nbind = \"127.0.0.1:0\"\ndatabase_path = {:?}\n\n[queue]\nmax_concurrent_runs = 3\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    auditrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("AI-driven audit runs"));
}

#[test]
fn test_cli_version() {
    auditrun()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("auditrun"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["runs", "list", "--help"],
        vec!["confirmations", "respond", "--help"],
        vec!["catalog", "import", "--help"],
    ] {
        auditrun().args(&args).assert().success();
    }
}

#[test]
fn test_check_config_prints_effective_values() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    auditrun()
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrent_runs = 3"))
        .stdout(predicate::str::contains("configuration OK"));
}

#[test]
fn test_check_config_rejects_zero_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[queue]\nmax_concurrent_runs = 0\n").unwrap();

    auditrun()
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_concurrent_runs"));
}

#[test]
fn test_catalog_import_then_list_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let catalog = dir.path().join("catalog.toml");
    std::fs::write(
        &catalog,
        r#"
[[sessions]]
id = "q3"
name = "Q3 review"

[[configs]]
id = "default"
name = "default"
[configs.llm]
provider = "scripted"

[[test_cases]]
id = "tc-1"
session_id = "q3"
position = 1
title = "Admin MFA"
expected_result = "all admins have MFA"
"#,
    )
    .unwrap();

    auditrun()
        .arg("--config")
        .arg(&config)
        .args(["catalog", "import"])
        .arg(&catalog)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Imported 1 sessions, 1 configurations, 1 test cases.",
        ));

    auditrun()
        .arg("--config")
        .arg(&config)
        .args(["runs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs found."));

    auditrun()
        .arg("--config")
        .arg(&config)
        .args(["confirmations", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No confirmation requests found."));
}
