//! End-to-end CLI tests for the transfer-manager binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

/// A command isolated from the user's config and data directories.
fn cmd(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("transfer-manager").unwrap();
    cmd.env("XDG_CONFIG_HOME", home.path().join("config"))
        .env("XDG_DATA_HOME", home.path().join("data"))
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(home.path().join("transfers.db"));
    cmd
}

#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("transfer-manager").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage").and(predicate::str::contains("get")));
}

#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("transfer-manager").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("transfer-manager"));
}

#[test]
fn test_binary_without_command_fails() {
    let mut cmd = Command::cargo_bin("transfer-manager").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_list_on_empty_database() {
    let home = TempDir::new().unwrap();
    cmd(&home)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No transfers"));
}

#[test]
fn test_run_with_nothing_queued() {
    let home = TempDir::new().unwrap();
    cmd(&home)
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to do"));
}

#[test]
fn test_pause_unknown_id_fails() {
    let home = TempDir::new().unwrap();
    cmd(&home)
        .args(["pause", "no-such-id"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("transfer not found"));
}

#[test]
fn test_invalid_config_file_is_reported() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("bad.toml");
    std::fs::write(&config, "max_concurrent = 0\n").unwrap();
    cmd(&home)
        .arg("--config")
        .arg(&config)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_concurrent"));
}

#[test]
fn test_name_with_multiple_urls_rejected() {
    let home = TempDir::new().unwrap();
    cmd(&home)
        .args([
            "get",
            "https://example.com/a",
            "https://example.com/b",
            "-n",
            "x.bin",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--name"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_downloads_and_list_shows_completed() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
        .mount(&server)
        .await;

    let home = TempDir::new().unwrap();
    let out = home.path().join("out");
    let url = format!("{}/data.bin", server.uri());

    let get_cmd = {
        let mut get = cmd(&home);
        get.args(["-q", "get", &url, "-o"]).arg(&out);
        get
    };
    // The binary blocks until the download finishes; keep the mock server's
    // runtime free to answer.
    tokio::task::spawn_blocking(move || {
        let mut get = get_cmd;
        get.assert().success();
    })
    .await
    .unwrap();

    assert_eq!(std::fs::read(out.join("data.bin")).unwrap(), vec![7u8; 4096]);

    let listing = tokio::task::spawn_blocking(move || {
        cmd(&home).arg("list").assert().success().get_output().stdout.clone()
    })
    .await
    .unwrap();
    let listing = String::from_utf8(listing).unwrap();
    assert!(listing.contains("completed"));
    assert!(listing.contains("data.bin"));
}
