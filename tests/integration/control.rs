#[path = "common/mod.rs"]
mod common;

use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    time::Duration,
};

use assert_cmd::Command;
use common::{DaemonUnderTest, sh_declaration, write_script};
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::tempdir;

#[test]
fn ping_round_trips() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let data = daemon.request_ok("ping", Value::Null);
    assert_eq!(data, json!("pong"));
}

#[test]
fn malformed_request_closes_only_its_connection() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let mut stream = UnixStream::connect(daemon.socket_path()).expect("connect");
    stream.write_all(b"this is not json\n").expect("write");
    stream.flush().expect("flush");
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let response: Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(response["success"], json!(false));

    // The connection is closed after the protocol error.
    line.clear();
    let eof = reader.read_line(&mut line).expect("read eof");
    assert_eq!(eof, 0);

    // Other connections keep working.
    assert_eq!(daemon.request_ok("ping", Value::Null), json!("pong"));
}

#[test]
fn unknown_target_and_webui_yield_failure_responses() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let response = daemon.request("stop", json!({ "name": "missing" }));
    assert_eq!(response["success"], json!(false));
    assert!(
        response["error"]
            .as_str()
            .expect("error message")
            .contains("missing")
    );

    let response = daemon.request("webui", Value::Null);
    assert_eq!(response["success"], json!(false));
}

#[test]
fn logs_operation_returns_child_output() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let script = write_script(
        temp.path(),
        "chatty.sh",
        "echo line-one\necho line-two\nsleep 30\n",
    );
    daemon.request_ok("start", sh_declaration(&script, "chatty"));
    daemon.wait_for_process("chatty", Duration::from_secs(5), |process| {
        process["status"] == json!("running")
    });

    // Give the writer threads a moment to drain the pipes.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let lines = loop {
        let data = daemon.request_ok("logs", json!({ "name": "chatty", "lines": 10 }));
        let lines = data["lines"].as_array().expect("lines").clone();
        if lines.len() >= 2 || std::time::Instant::now() > deadline {
            break lines;
        }
        std::thread::sleep(Duration::from_millis(100));
    };
    assert!(lines.contains(&json!("line-one")));
    assert!(lines.contains(&json!("line-two")));

    daemon.request_ok("stop", json!({ "name": "chatty", "force": true }));
}

#[test]
fn cli_ping_talks_to_daemon() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("noded"));
    command
        .arg("ping")
        .env("HOME", &home)
        .assert()
        .success()
        .stdout(predicate::str::contains("pong"));

    drop(daemon);
}

#[test]
fn cli_fails_cleanly_without_daemon() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).expect("home");

    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("noded"));
    command.arg("ping").env("HOME", &home).assert().failure();
}

#[test]
fn cli_rejects_unknown_subcommands() {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("noded"));
    command.arg("frobnicate").assert().failure().code(2);
}
