#[path = "common/mod.rs"]
mod common;

use std::{thread, time::Duration};

use common::{DaemonUnderTest, sh_declaration, write_script};
use serde_json::json;
use tempfile::tempdir;

#[test]
fn crashing_process_retries_then_errors_out() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    let script = write_script(temp.path(), "crash.sh", "exit 1\n");
    let mut declaration = sh_declaration(&script, "crasher");
    declaration["maxRestarts"] = json!(3);
    declaration["restartDelay"] = json!(100);
    declaration["maxRestartDelay"] = json!(1000);
    daemon.request_ok("start", declaration);

    // 100 + 200 + 400 ms of backoff plus four short runs: well under 10 s.
    // Wait on the replica state: the process-level status also reads
    // `errored` transiently while a crashed replica awaits its timer.
    let process =
        daemon.wait_for_process("crasher", Duration::from_secs(10), |process| {
            process["replicas"][0]["status"] == json!("errored")
        });
    assert_eq!(process["status"], json!("errored"));
    let replica = &process["replicas"][0];
    assert_eq!(replica["restarts"], json!(3));
    assert!(replica.get("pid").is_none());

    // No further restarts occur once the budget is exhausted.
    thread::sleep(Duration::from_millis(1500));
    let process =
        daemon.wait_for_process("crasher", Duration::from_secs(1), |process| {
            process["replicas"][0]["status"] == json!("errored")
        });
    assert_eq!(process["replicas"][0]["restarts"], json!(3));
}

#[test]
fn stable_run_resets_the_restart_budget() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    let daemon = DaemonUnderTest::spawn(&home);

    // Runs long enough to clear minUptime, then crashes.
    let script = write_script(temp.path(), "flaky.sh", "sleep 1\nexit 1\n");
    let mut declaration = sh_declaration(&script, "flaky");
    declaration["maxRestarts"] = json!(2);
    declaration["restartDelay"] = json!(50);
    declaration["maxRestartDelay"] = json!(200);
    declaration["minUptime"] = json!(500);
    daemon.request_ok("start", declaration);

    // After the first crash the uptime (~1 s) exceeds minUptime (500 ms),
    // so the counter resets and the process keeps being restarted instead
    // of erroring out after two attempts.
    thread::sleep(Duration::from_millis(3500));
    let process =
        daemon.wait_for_process("flaky", Duration::from_secs(5), |process| {
            process["status"] == json!("running")
                || process["status"] == json!("starting")
        });
    let restarts = process["replicas"][0]["restarts"].as_u64().expect("count");
    assert!(restarts <= 2, "restart counter should keep resetting");

    daemon.request_ok("stop", json!({ "name": "flaky", "force": true }));
}
