//! Smoke tests -- verify the binary runs and its subcommands parse.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

fn demos() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos")
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("gattbench")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Bluetooth Low Energy peripherals"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("gattbench")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("gattbench"));
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("gattbench")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--address"));
}

#[test]
fn test_list_shows_demo_tests() {
    Command::cargo_bin("gattbench")
        .unwrap()
        .arg("list")
        .arg("--dir")
        .arg(demos())
        .assert()
        .success()
        .stdout(predicates::str::contains("test_blinky.test_led_on"))
        .stdout(predicates::str::contains("Turn the LED on"));
}

#[test]
fn test_list_with_unmatched_selector_fails() {
    Command::cargo_bin("gattbench")
        .unwrap()
        .args(["list", "--test", "test_does_not_exist", "--dir"])
        .arg(demos())
        .assert()
        .failure()
        .stderr(predicates::str::contains("no tests match"));
}

#[test]
fn test_run_without_target_is_rejected() {
    let scratch = tempfile::tempdir().unwrap();
    Command::cargo_bin("gattbench")
        .unwrap()
        .current_dir(scratch.path())
        .env_remove("GATTBENCH_CONFIG")
        .args(["run", "--dir"])
        .arg(demos())
        .assert()
        .failure()
        .stderr(predicates::str::contains("pass --address or --name").and(predicates::str::contains("interactive")));
}

#[test]
fn test_config_file_from_environment_sets_selector() {
    let scratch = tempfile::tempdir().unwrap();
    let config = scratch.path().join("bench.toml");
    std::fs::write(&config, "[tests]\nselect = \"test_led_on\"\n").unwrap();

    Command::cargo_bin("gattbench")
        .unwrap()
        .env("GATTBENCH_CONFIG", &config)
        .args(["list", "--dir"])
        .arg(demos())
        .assert()
        .success()
        .stdout(predicates::str::contains("test_blinky.test_led_on"))
        .stdout(predicates::str::contains("test_led_off").not())
        .stdout(predicates::str::contains("1 test(s)"));
}

#[test]
fn test_unreadable_config_from_environment_is_an_error() {
    let scratch = tempfile::tempdir().unwrap();
    Command::cargo_bin("gattbench")
        .unwrap()
        .env("GATTBENCH_CONFIG", scratch.path().join("missing.toml"))
        .args(["list", "--dir"])
        .arg(demos())
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to read config file"));
}
