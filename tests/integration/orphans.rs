#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::DaemonUnderTest;
use serde_json::json;
use tempfile::tempdir;

/// A replica recorded as running under a pid that no longer exists must be
/// reconciled to `stopped` when the daemon boots.
#[test]
fn dead_pids_are_reconciled_on_startup() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let state_dir = home.join(".nodedaemon");
    fs::create_dir_all(&state_dir).expect("state dir");

    // Far above any default pid_max, so certainly not a live process.
    let seeded = json!({
        "version": "1",
        "startedAt": 1_700_000_000_000u64,
        "pid": 12345,
        "savedAt": 1_700_000_000_500u64,
        "processes": [{
            "id": "proc-orphan",
            "name": "ghost",
            "script": "/srv/ghost/server.js",
            "config": {
                "script": "/srv/ghost/server.js",
                "name": "ghost",
            },
            "replicas": [{
                "id": "replica-orphan",
                "pid": 3_999_999,
                "status": "running",
                "uptimeStart": 1_700_000_000_000u64,
                "restarts": 0,
            }],
            "status": "running",
            "createdAt": 1_700_000_000_000u64,
            "updatedAt": 1_700_000_000_000u64,
        }],
    });
    fs::write(
        state_dir.join("state.json"),
        serde_json::to_string_pretty(&seeded).expect("encode"),
    )
    .expect("seed state file");

    let daemon = DaemonUnderTest::spawn(&home);
    let process = daemon.wait_for_process("ghost", Duration::from_secs(5), |process| {
        process["status"] == json!("stopped")
    });
    let replica = &process["replicas"][0];
    assert_eq!(replica["status"], json!("stopped"));
    assert!(replica.get("pid").is_none());
}

/// An unparseable state file must not prevent the daemon from starting.
#[test]
fn corrupt_state_file_starts_empty() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let state_dir = home.join(".nodedaemon");
    fs::create_dir_all(&state_dir).expect("state dir");
    fs::write(state_dir.join("state.json"), "{definitely not json").expect("seed");

    let daemon = DaemonUnderTest::spawn(&home);
    assert!(daemon.list().is_empty());
}
