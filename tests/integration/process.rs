#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{DaemonUnderTest, sh_declaration, write_script};
use serde_json::{Value, json};
use tempfile::tempdir;

#[test]
fn start_then_stop_updates_state_and_disk() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let script = write_script(temp.path(), "server.sh", "sleep 30\n");
    let started = daemon.request_ok("start", sh_declaration(&script, "web"));
    let id = started["id"].as_str().expect("id").to_string();

    let process = daemon.wait_for_process("web", Duration::from_secs(5), |process| {
        process["status"] == json!("running")
    });
    assert_eq!(process["id"], json!(id));
    let replicas = process["replicas"].as_array().expect("replicas");
    assert_eq!(replicas.len(), 1);
    let pid = replicas[0]["pid"].as_u64().expect("pid");
    assert!(pid > 0);

    let stopped = daemon.request_ok("stop", json!({ "id": id }));
    assert_eq!(stopped["status"], json!("stopped"));
    assert!(stopped["replicas"][0].get("pid").is_none());

    // The state file catches up with the stop and stays a complete document.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if daemon.state_path().exists() {
            let raw = fs::read_to_string(daemon.state_path()).expect("state file");
            let state: Value = serde_json::from_str(&raw).expect("valid state json");
            let persisted = &state["processes"][0];
            if persisted["status"] == json!("stopped") {
                assert_eq!(persisted["name"], json!("web"));
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "state file never recorded the stop"
        );
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn cluster_start_spawns_declared_replicas() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let script = write_script(temp.path(), "worker.sh", "sleep 30\n");
    let mut declaration = sh_declaration(&script, "workers");
    declaration["instances"] = json!(3);
    daemon.request_ok("start", declaration);

    let process =
        daemon.wait_for_process("workers", Duration::from_secs(5), |process| {
            process["status"] == json!("running")
        });
    let replicas = process["replicas"].as_array().expect("replicas");
    assert_eq!(replicas.len(), 3);
    for replica in replicas {
        assert_eq!(replica["status"], json!("running"));
        assert!(replica["pid"].as_u64().is_some());
    }

    daemon.request_ok("stop", json!({ "name": "workers", "force": true }));
}

#[test]
fn delete_requires_terminal_process() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let script = write_script(temp.path(), "server.sh", "sleep 30\n");
    daemon.request_ok("start", sh_declaration(&script, "web"));
    daemon.wait_for_process("web", Duration::from_secs(5), |process| {
        process["status"] == json!("running")
    });

    let refused = daemon.request("delete", json!({ "name": "web" }));
    assert_eq!(refused["success"], json!(false));

    daemon.request_ok("stop", json!({ "name": "web", "force": true }));
    daemon.request_ok("delete", json!({ "name": "web" }));
    assert!(daemon.list().is_empty());
}

#[test]
fn watch_restarts_only_on_content_change() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let watched = temp.path().join("watched");
    fs::create_dir_all(&watched).expect("watched dir");
    let config_file = watched.join("app.conf");
    fs::write(&config_file, "port=3000\n").expect("seed config");

    let script = write_script(temp.path(), "server.sh", "sleep 30\n");
    let mut declaration = sh_declaration(&script, "watched-web");
    declaration["watch"] = json!([watched.to_string_lossy()]);
    daemon.request_ok("start", declaration);

    let before =
        daemon.wait_for_process("watched-web", Duration::from_secs(5), |process| {
            process["status"] == json!("running")
        });
    let pid_before = before["replicas"][0]["pid"].as_u64().expect("pid");

    // Identical rewrites: content unchanged, no restart.
    for _ in 0..5 {
        fs::write(&config_file, "port=3000\n").expect("rewrite");
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(1000));
    let unchanged =
        daemon.wait_for_process("watched-web", Duration::from_secs(2), |process| {
            process["status"] == json!("running")
        });
    assert_eq!(
        unchanged["replicas"][0]["pid"].as_u64(),
        Some(pid_before),
        "identical content must not trigger a restart"
    );

    // A real content change restarts the process.
    fs::write(&config_file, "port=4000\n").expect("modify");
    daemon.wait_for_process("watched-web", Duration::from_secs(10), |process| {
        process["status"] == json!("running")
            && process["replicas"][0]["pid"].as_u64() != Some(pid_before)
    });

    daemon.request_ok("stop", json!({ "name": "watched-web", "force": true }));
}

#[test]
fn restart_returns_process_to_running() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let script = write_script(temp.path(), "server.sh", "sleep 30\n");
    daemon.request_ok("start", sh_declaration(&script, "web"));
    let before = daemon.wait_for_process("web", Duration::from_secs(5), |process| {
        process["status"] == json!("running")
    });
    let pid_before = before["replicas"][0]["pid"].as_u64().expect("pid");

    let restarted = daemon.request_ok("restart", json!({ "name": "web" }));
    assert_eq!(restarted["status"], json!("running"));
    let pid_after = restarted["replicas"][0]["pid"].as_u64().expect("pid");
    assert_ne!(pid_before, pid_after);

    daemon.request_ok("stop", json!({ "name": "web", "force": true }));
}
