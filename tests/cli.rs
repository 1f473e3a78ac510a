mod common;

use assert_cmd::Command;
use common::range_server;
use tempfile::tempdir;

fn kfetch() -> Command {
    Command::cargo_bin("kfetch").unwrap()
}

#[test]
fn rejects_unsupported_scheme() {
    kfetch()
        .args(["--quiet", "ftp://example.com/file.bin"])
        .assert()
        .failure();
}

#[test]
fn requires_a_url() {
    kfetch().assert().failure();
}

#[test]
fn downloads_to_the_requested_path() {
    let body = range_server::payload(200 * 1024);
    let server = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let target = dir.path().join("copy.bin");

    kfetch()
        .args(["--quiet", "--chunk-size", "8192", "-o"])
        .arg(&target)
        .arg(&server.url)
        .assert()
        .success();

    assert_eq!(std::fs::read(&target).unwrap(), body);
}

#[test]
fn json_progress_ends_with_a_complete_event() {
    let server = range_server::start(range_server::payload(64 * 1024));
    let dir = tempdir().unwrap();
    let target = dir.path().join("copy.bin");

    let output = kfetch()
        .args(["--json", "-o"])
        .arg(&target)
        .arg(&server.url)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let last = stdout.lines().last().expect("at least one event");
    let event: serde_json::Value = serde_json::from_str(last).unwrap();
    assert_eq!(event["event"], "complete");
    assert_eq!(event["bytes_downloaded"], 64 * 1024);
}

#[test]
fn unreachable_server_exits_non_zero() {
    let dir = tempdir().unwrap();
    kfetch()
        .args(["--quiet", "--retries", "1", "-o"])
        .arg(dir.path().join("out.bin"))
        .arg(range_server::refused_url())
        .assert()
        .failure();
}
