#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{DaemonUnderTest, sh_declaration, write_script};
use serde_json::{Value, json};
use tempfile::tempdir;

/// A child that ignores SIGTERM is killed after the grace period and the
/// daemon still exits cleanly. The grace windows are shortened via the
/// test-only environment overrides.
#[test]
fn shutdown_escalates_on_sigterm_ignoring_child() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn_with_env(
        &home,
        &[
            ("NODEDAEMON_GRACE_TIMEOUT_MS", "500"),
            ("NODEDAEMON_FORCE_TIMEOUT_MS", "2000"),
        ],
    );

    let script = write_script(
        temp.path(),
        "stubborn.sh",
        "trap '' TERM\nwhile true; do sleep 1; done\n",
    );
    daemon.request_ok("start", sh_declaration(&script, "stubborn"));
    daemon.wait_for_process("stubborn", Duration::from_secs(5), |process| {
        process["status"] == json!("running")
    });

    let mut daemon = daemon;
    daemon.request_ok("shutdown", Value::Null);
    assert!(
        daemon.wait_for_exit(Duration::from_secs(15)),
        "daemon did not exit after shutdown"
    );

    // The flushed state records the forced stop.
    let raw = std::fs::read_to_string(daemon.state_path()).expect("state file");
    let state: Value = serde_json::from_str(&raw).expect("valid state json");
    assert_eq!(state["processes"][0]["status"], json!("stopped"));
    assert!(state["processes"][0]["replicas"][0].get("pid").is_none());
}

/// Shutdown is idempotent at the protocol level: a second request while
/// the daemon is going down either succeeds or finds the socket gone.
#[test]
fn repeated_shutdown_is_harmless() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let mut daemon = DaemonUnderTest::spawn(&home);

    daemon.request_ok("shutdown", Value::Null);
    assert!(daemon.wait_for_exit(Duration::from_secs(10)));
}

/// SIGTERM to the daemon triggers the same graceful shutdown path as the
/// control-plane request.
#[test]
fn sigterm_shuts_the_daemon_down() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let mut daemon = DaemonUnderTest::spawn(&home);

    let script = write_script(temp.path(), "server.sh", "sleep 30\n");
    daemon.request_ok("start", sh_declaration(&script, "web"));
    daemon.wait_for_process("web", Duration::from_secs(5), |process| {
        process["status"] == json!("running")
    });

    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(daemon.pid().to_string())
        .status()
        .expect("kill");
    assert!(status.success());
    assert!(
        daemon.wait_for_exit(Duration::from_secs(15)),
        "daemon did not exit on SIGTERM"
    );

    let raw = std::fs::read_to_string(daemon.state_path()).expect("state file");
    let state: Value = serde_json::from_str(&raw).expect("valid state json");
    assert_eq!(state["processes"][0]["status"], json!("stopped"));
}

/// SIGHUP restarts running processes without taking the daemon down.
#[test]
fn sighup_reloads_running_processes() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let script = write_script(temp.path(), "server.sh", "sleep 30\n");
    daemon.request_ok("start", sh_declaration(&script, "web"));
    let before = daemon.wait_for_process("web", Duration::from_secs(5), |process| {
        process["status"] == json!("running")
    });
    let pid_before = before["replicas"][0]["pid"].as_u64().expect("pid");

    let status = std::process::Command::new("kill")
        .arg("-HUP")
        .arg(daemon.pid().to_string())
        .status()
        .expect("kill");
    assert!(status.success());

    let after = daemon.wait_for_process("web", Duration::from_secs(10), |process| {
        process["status"] == json!("running")
            && process["replicas"][0]["pid"].as_u64() != Some(pid_before)
    });
    assert_eq!(after["status"], json!("running"));

    daemon.request_ok("stop", json!({ "name": "web", "force": true }));
    daemon.request_ok("shutdown", Value::Null);
}
