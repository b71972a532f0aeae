//! Data model for managed processes and their replicas.

use serde::{Deserialize, Serialize};

use crate::{
    clock::{epoch_ms, new_id},
    config::ProcessConfig,
    error::DaemonError,
};

/// Lifecycle state of a single replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    /// The replica is being launched.
    Starting,
    /// The OS child is up.
    Running,
    /// A stop has been issued and the child has not exited yet.
    Stopping,
    /// The child exited cleanly or was stopped.
    Stopped,
    /// The replica gave up: spawn failure, start timeout, or restart budget
    /// exhausted.
    Errored,
    /// The child exited unexpectedly; a restart may be pending.
    Crashed,
}

impl ReplicaStatus {
    /// Terminal states require no further supervision.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicaStatus::Stopped | ReplicaStatus::Errored)
    }
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ReplicaStatus::Starting => "starting",
            ReplicaStatus::Running => "running",
            ReplicaStatus::Stopping => "stopping",
            ReplicaStatus::Stopped => "stopped",
            ReplicaStatus::Errored => "errored",
            ReplicaStatus::Crashed => "crashed",
        };
        write!(f, "{label}")
    }
}

/// Lifecycle state of a managed process, reduced from its replicas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// At least one replica is still coming up.
    Starting,
    /// At least one replica is running.
    Running,
    /// An explicit stop is in progress.
    Stopping,
    /// Every replica is stopped.
    Stopped,
    /// At least one replica crashed or errored and none is running.
    Errored,
    /// A reload is replacing the replicas.
    Reloading,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Errored => "errored",
            ProcessStatus::Reloading => "reloading",
        };
        write!(f, "{label}")
    }
}

/// How the children of a process are launched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMethod {
    /// Several workers of the same script under one supervisor.
    Cluster,
    /// A child of the JavaScript runtime launched directly.
    Fork,
    /// The configured interpreter executes the script.
    Spawn,
}

/// Decides the launch method for a declaration.
///
/// More than one instance forces the cluster path; otherwise `.js`/`.mjs`
/// scripts use the runtime directly and everything else goes through the
/// configured interpreter.
pub fn launch_method(config: &ProcessConfig) -> LaunchMethod {
    if config.instances.resolve().map(|n| n > 1).unwrap_or(false) {
        return LaunchMethod::Cluster;
    }
    let script = config.script.to_ascii_lowercase();
    if script.ends_with(".js") || script.ends_with(".mjs") {
        LaunchMethod::Fork
    } else {
        LaunchMethod::Spawn
    }
}

/// A single OS-level worker slot of a managed process.
///
/// The record survives restarts: relaunching a slot reuses the same
/// `Replica`, incrementing `restarts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Replica {
    /// Opaque id, unique within the parent process.
    pub id: String,
    /// OS pid; present iff status is running or stopping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Current lifecycle state.
    pub status: ReplicaStatus,
    /// Epoch milliseconds of the most recent successful start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_start: Option<u64>,
    /// Automatic relaunch attempts for this slot.
    pub restarts: u32,
    /// Epoch milliseconds of the most recent restart attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<u64>,
}

impl Replica {
    /// Creates a fresh slot in the `starting` state.
    pub fn new() -> Self {
        Self {
            id: new_id(),
            pid: None,
            status: ReplicaStatus::Starting,
            uptime_start: None,
            restarts: 0,
            last_restart: None,
        }
    }

    /// Uptime of the current run in milliseconds, if running.
    pub fn uptime_ms(&self, now: u64) -> Option<u64> {
        self.uptime_start.map(|start| now.saturating_sub(start))
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// A user-declared unit of supervision with one or more replicas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ManagedProcess {
    /// Opaque id, unique daemon-wide, immutable.
    pub id: String,
    /// Human label, unique across active processes.
    pub name: String,
    /// Absolute path of the supervised program.
    pub script: String,
    /// The immutable declaration.
    pub config: ProcessConfig,
    /// Ordered replica slots; never empty for a live process.
    pub replicas: Vec<Replica>,
    /// Reduced lifecycle state.
    pub status: ProcessStatus,
    /// Creation timestamp, epoch milliseconds.
    pub created_at: u64,
    /// Last mutation timestamp, epoch milliseconds.
    pub updated_at: u64,
}

impl ManagedProcess {
    /// Builds a new process from a validated declaration.
    pub fn from_config(config: ProcessConfig) -> Result<Self, DaemonError> {
        let replica_count = config.instances.resolve()?;
        let now = epoch_ms();
        Ok(Self {
            id: new_id(),
            name: config.resolved_name(),
            script: config.script.clone(),
            config,
            replicas: (0..replica_count).map(|_| Replica::new()).collect(),
            status: ProcessStatus::Starting,
            created_at: now,
            updated_at: now,
        })
    }

    /// Recomputes the reduced status from the replica statuses.
    pub fn reduce_status(&mut self) {
        self.status = reduce_status(&self.replicas);
    }

    /// Whether every replica is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.replicas.iter().all(|r| r.status.is_terminal())
    }

    /// Looks up a replica slot by id.
    pub fn replica(&self, replica_id: &str) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.id == replica_id)
    }

    /// Looks up a replica slot by id, mutably.
    pub fn replica_mut(&mut self, replica_id: &str) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.id == replica_id)
    }
}

/// The deterministic reduction of replica statuses (first match wins):
/// any running → running; any errored or crashed → errored; all stopped →
/// stopped; otherwise starting.
pub fn reduce_status(replicas: &[Replica]) -> ProcessStatus {
    if replicas.iter().any(|r| r.status == ReplicaStatus::Running) {
        return ProcessStatus::Running;
    }
    if replicas
        .iter()
        .any(|r| matches!(r.status, ReplicaStatus::Errored | ReplicaStatus::Crashed))
    {
        return ProcessStatus::Errored;
    }
    if !replicas.is_empty()
        && replicas.iter().all(|r| r.status == ReplicaStatus::Stopped)
    {
        return ProcessStatus::Stopped;
    }
    ProcessStatus::Starting
}
