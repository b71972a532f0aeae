//! Shared helpers for the integration suite: a daemon under test plus a
//! minimal raw client for the control socket.
#![allow(dead_code)]

use std::{
    fs,
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use serde_json::{Value, json};

/// A `noded daemon` process bound to a scratch `HOME`.
pub struct DaemonUnderTest {
    child: Child,
    home: PathBuf,
}

impl DaemonUnderTest {
    /// Spawns the daemon with `HOME` pointed at `home` and waits for its
    /// control socket to appear.
    pub fn spawn(home: &Path) -> Self {
        Self::spawn_with_env(home, &[])
    }

    /// Same as [`DaemonUnderTest::spawn`] with extra environment entries.
    pub fn spawn_with_env(home: &Path, extra_env: &[(&str, &str)]) -> Self {
        fs::create_dir_all(home).expect("failed to create scratch home");
        let mut command = Command::new(assert_cmd::cargo::cargo_bin!("noded"));
        command
            .arg("daemon")
            .arg("--log-level")
            .arg("debug")
            .env("HOME", home)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in extra_env {
            command.env(key, value);
        }
        let child = command.spawn().expect("failed to spawn daemon");
        let daemon = Self {
            child,
            home: home.to_path_buf(),
        };
        daemon.wait_for_socket(Duration::from_secs(10));
        daemon
    }

    /// The daemon's OS pid.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The daemon's control socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.home.join(".nodedaemon/daemon.sock")
    }

    /// The daemon's persisted state file path.
    pub fn state_path(&self) -> PathBuf {
        self.home.join(".nodedaemon/state.json")
    }

    fn wait_for_socket(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.socket_path().exists() {
            assert!(
                Instant::now() < deadline,
                "daemon never created its control socket"
            );
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Sends one request over a fresh connection and returns the response.
    pub fn request(&self, kind: &str, data: Value) -> Value {
        send_raw(&self.socket_path(), kind, data)
    }

    /// Convenience wrapper asserting the request succeeded.
    pub fn request_ok(&self, kind: &str, data: Value) -> Value {
        let response = self.request(kind, data);
        assert_eq!(
            response["success"],
            json!(true),
            "request '{kind}' failed: {response}"
        );
        response["data"].clone()
    }

    /// Fetches the current process list.
    pub fn list(&self) -> Vec<Value> {
        self.request_ok("list", Value::Null)
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    /// Polls the process list until `check` passes for the named process.
    pub fn wait_for_process<F>(&self, name: &str, timeout: Duration, check: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(process) = self
                .list()
                .into_iter()
                .find(|process| process["name"] == json!(name))
                && check(&process)
            {
                return process;
            }
            assert!(
                Instant::now() < deadline,
                "process '{name}' never reached the expected state; list: {:?}",
                self.list()
            );
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Waits for the daemon process itself to exit.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => return false,
            }
        }
        false
    }
}

impl Drop for DaemonUnderTest {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Sends one newline-delimited JSON request over `socket` and parses the
/// single-line response.
pub fn send_raw(socket: &Path, kind: &str, data: Value) -> Value {
    let request = json!({
        "id": format!("test-{kind}"),
        "type": kind,
        "data": data,
        "timestamp": 0,
    });
    let mut stream = UnixStream::connect(socket).expect("failed to connect");
    stream
        .write_all(request.to_string().as_bytes())
        .expect("failed to write request");
    stream.write_all(b"\n").expect("failed to write newline");
    stream.flush().expect("failed to flush");

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).expect("failed to read response");
    serde_json::from_str(line.trim()).expect("response is not valid JSON")
}

/// Writes a shell script into `dir` and returns its absolute path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("failed to write script");
    path
}

/// Declaration payload for a shell script run through `sh`.
pub fn sh_declaration(script: &Path, name: &str) -> Value {
    json!({
        "script": script.to_string_lossy(),
        "name": name,
        "interpreter": "sh",
    })
}
