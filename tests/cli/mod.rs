/// lxced binary
use super::setup_test_env;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

#[test]
fn test_help() {
    Command::cargo_bin("lxced")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_missing_config_fails() {
    let dir = setup_test_env();
    Command::cargo_bin("lxced")
        .unwrap()
        .args(["--config"])
        .arg(dir.path().join("absent.toml"))
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_check_prints_spaces() {
    let dir = setup_test_env();
    let space = dir.path().join("boot.json");
    fs::write(
        &space,
        r#"{"version": "0.1", "target": "all", "name": "bootspace",
            "namespaces": [{"type": "uts"}]}"#,
    )
    .unwrap();
    let config = dir.path().join("lxce.toml");
    fs::write(
        &config,
        format!(
            "[config]\nlevel = \"ERROR\"\nmanifest = \"{}\"\nspaces = [\"{}\"]\n",
            dir.path().join("manifest.json").display(),
            space.display()
        ),
    )
    .unwrap();

    Command::cargo_bin("lxced")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootspace"))
        .stdout(predicate::str::contains("CAP_").not());
}

#[test]
fn test_check_rejects_bad_level() {
    let dir = setup_test_env();
    let config = dir.path().join("lxce.toml");
    fs::write(&config, "[config]\nlevel = \"LOUD\"\nmanifest = \"/nonexistent\"\n").unwrap();

    Command::cargo_bin("lxced")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown log level"));
}
