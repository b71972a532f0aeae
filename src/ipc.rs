//! Local control plane: newline-delimited JSON over a Unix socket.
//!
//! Clients write one request object per line and read one response object
//! back. Responses echo the request id. A malformed (non-JSON) line is a
//! protocol error: the offending connection is answered and closed, other
//! connections are unaffected.

use std::{
    io::{self, BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::mpsc::Sender,
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    clock::{epoch_ms, new_id},
    config::ProcessConfig,
    constants::DEFAULT_LOG_TAIL_LINES,
    error::DaemonError,
    logs,
    orchestrator::Orchestrator,
    ratelimit::RateLimiter,
    runtime,
    signals::DaemonSignal,
};

/// Request types accepted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Start,
    Stop,
    Restart,
    Delete,
    List,
    Logs,
    Status,
    Ping,
    Shutdown,
    Webui,
}

/// A control-plane request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Opaque client-chosen id, echoed in the response.
    pub id: String,
    /// Operation to perform.
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Operation payload; shape depends on `kind`.
    #[serde(default)]
    pub data: Value,
    /// Client timestamp, epoch milliseconds.
    #[serde(default)]
    pub timestamp: u64,
}

impl Request {
    /// Builds a request with a fresh id and the current timestamp.
    pub fn new(kind: RequestKind, data: Value) -> Self {
        Self {
            id: new_id(),
            kind,
            data,
            timestamp: epoch_ms(),
        }
    }
}

/// A control-plane response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the request id.
    pub id: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Operation result, when successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Short error message, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Daemon timestamp, epoch milliseconds.
    pub timestamp: u64,
}

impl Response {
    fn ok(id: &str, data: Value) -> Self {
        Self {
            id: id.to_string(),
            success: true,
            data: Some(data),
            error: None,
            timestamp: epoch_ms(),
        }
    }

    fn failure(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: epoch_ms(),
        }
    }
}

/// Common payload shape for operations addressing one process.
#[derive(Debug, Default, Deserialize)]
struct TargetPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    lines: Option<usize>,
}

impl TargetPayload {
    fn parse(data: &Value) -> Self {
        serde_json::from_value(data.clone()).unwrap_or_default()
    }

    fn target(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }
}

/// Errors raised by the client-side helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    /// Error serializing or deserializing control messages.
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    /// Control socket not present; the daemon is not running.
    #[error("daemon is not running (control socket not available)")]
    NotAvailable,
    /// The daemon reported a failure.
    #[error("daemon reported error: {0}")]
    Server(String),
}

/// Accepts connections and serves requests until shutdown begins.
///
/// Connections are handled inline: mutating operations serialize on the
/// orchestrator anyway, and the protocol is strictly request/response.
pub fn serve(
    listener: UnixListener,
    orchestrator: Orchestrator,
    control_tx: Sender<DaemonSignal>,
) -> io::Result<()> {
    let limiter = RateLimiter::ipc();
    for connection in listener.incoming() {
        if orchestrator.is_shutting_down() {
            return Ok(());
        }
        match connection {
            Ok(stream) => {
                handle_connection(stream, &orchestrator, &limiter, &control_tx)
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!("control listener error: {err}");
                return Err(err);
            }
        }
        if orchestrator.is_shutting_down() {
            return Ok(());
        }
    }
    Ok(())
}

fn handle_connection(
    stream: UnixStream,
    orchestrator: &Orchestrator,
    limiter: &RateLimiter,
    control_tx: &Sender<DaemonSignal>,
) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                debug!("control connection read failed: {err}");
                return;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(err) => {
                // Protocol error: answer once, then drop the connection.
                warn!("malformed control request: {err}");
                let _ = write_response(
                    &mut writer,
                    &Response::failure("", format!("malformed request: {err}")),
                );
                return;
            }
        };

        let response = if limiter.check("local") {
            dispatch(orchestrator, &request)
        } else {
            Response::failure(&request.id, "rate limit exceeded")
        };
        let shutdown_accepted =
            request.kind == RequestKind::Shutdown && response.success;

        if let Err(err) = write_response(&mut writer, &response) {
            debug!("failed to write control response: {err}");
            return;
        }
        if shutdown_accepted {
            let _ = control_tx.send(DaemonSignal::Shutdown);
            return;
        }
    }
}

fn write_response(stream: &mut UnixStream, response: &Response) -> io::Result<()> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Routes one request to the orchestrator and shapes the response.
pub fn dispatch(orchestrator: &Orchestrator, request: &Request) -> Response {
    let result = match request.kind {
        RequestKind::Ping => Ok(json!("pong")),
        RequestKind::List => serde_json::to_value(orchestrator.list())
            .map_err(|err| DaemonError::InvariantViolation(err.to_string())),
        RequestKind::Start => start_op(orchestrator, &request.data),
        RequestKind::Stop => target_op(orchestrator, &request.data, |id, payload| {
            let process = orchestrator.stop(id, payload.force)?;
            serde_json::to_value(process)
                .map_err(|err| DaemonError::InvariantViolation(err.to_string()))
        }),
        RequestKind::Restart => target_op(orchestrator, &request.data, |id, _| {
            let process = orchestrator.restart(id)?;
            serde_json::to_value(process)
                .map_err(|err| DaemonError::InvariantViolation(err.to_string()))
        }),
        RequestKind::Delete => target_op(orchestrator, &request.data, |id, _| {
            orchestrator.delete(id)?;
            Ok(json!({ "deleted": id }))
        }),
        RequestKind::Logs => target_op(orchestrator, &request.data, |id, payload| {
            let lines = payload.lines.unwrap_or(DEFAULT_LOG_TAIL_LINES);
            let tail = logs::tail(id, lines)?;
            Ok(json!({ "lines": tail }))
        }),
        RequestKind::Status => status_op(orchestrator, &request.data),
        RequestKind::Shutdown => Ok(json!({ "shuttingDown": true })),
        RequestKind::Webui => Err(DaemonError::Conflict(
            "web interface is not available".into(),
        )),
    };

    match result {
        Ok(data) => Response::ok(&request.id, data),
        Err(err) => Response::failure(&request.id, err.to_string()),
    }
}

fn start_op(orchestrator: &Orchestrator, data: &Value) -> Result<Value, DaemonError> {
    let config: ProcessConfig = serde_json::from_value(data.clone())
        .map_err(|err| DaemonError::Validation(err.to_string()))?;
    let id = orchestrator.start(config)?;
    Ok(json!({ "id": id }))
}

fn target_op<F>(
    orchestrator: &Orchestrator,
    data: &Value,
    operation: F,
) -> Result<Value, DaemonError>
where
    F: FnOnce(&str, &TargetPayload) -> Result<Value, DaemonError>,
{
    let payload = TargetPayload::parse(data);
    let target = payload
        .target()
        .ok_or_else(|| DaemonError::Validation("missing process id or name".into()))?;
    let id = orchestrator.resolve(target)?;
    operation(&id, &payload)
}

fn status_op(orchestrator: &Orchestrator, data: &Value) -> Result<Value, DaemonError> {
    let payload = TargetPayload::parse(data);
    match payload.target() {
        Some(target) => {
            let id = orchestrator.resolve(target)?;
            let process = orchestrator
                .get(&id)
                .ok_or_else(|| DaemonError::NotFound(id.clone()))?;
            let health: Vec<_> = orchestrator
                .health_check()
                .into_iter()
                .filter(|row| row.process_id == id)
                .collect();
            Ok(json!({ "process": process, "health": health }))
        }
        None => {
            let processes = orchestrator.list();
            Ok(json!({
                "pid": std::process::id(),
                "processCount": processes.len(),
                "health": orchestrator.health_check(),
            }))
        }
    }
}

// ----------------------------------------------------------------------
// Client helpers
// ----------------------------------------------------------------------

/// Sends one request to the resident daemon and awaits the response.
pub fn send_request(kind: RequestKind, data: Value) -> Result<Response, ControlError> {
    let path = runtime::socket_path();
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }
    let mut stream = UnixStream::connect(path)?;
    let request = Request::new(kind, data);
    let payload = serde_json::to_vec(&request)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }
    let response: Response = serde_json::from_str(line.trim())?;
    if !response.success {
        return Err(ControlError::Server(
            response
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".into()),
        ));
    }
    Ok(response)
}
