//! Durable persistence of the supervisor's view of the world.
//!
//! The store mirrors the orchestrator's in-memory table into a single JSON
//! document. Writes are debounced and periodic, and always atomic: the
//! document is written to a per-pid temporary file and renamed onto the
//! target so readers only ever observe a complete document.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, Sender, channel},
    },
    thread,
    time::{Duration, Instant},
};

use nix::{sys::signal::kill, unistd::Pid};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    clock::epoch_ms,
    constants::{AUTOSAVE_INTERVAL, SAVE_DEBOUNCE, STATE_SCHEMA_VERSION, STORE_TICK},
    error::StateStoreError,
    process::{ManagedProcess, ReplicaStatus},
};

/// The persisted top-level document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    /// Schema version of this document.
    pub version: String,
    /// Epoch milliseconds when the daemon that wrote this started.
    pub started_at: u64,
    /// Pid of the daemon that wrote this document.
    pub pid: u32,
    /// Epoch milliseconds of the last save.
    pub saved_at: u64,
    /// Every managed process with its replicas.
    pub processes: Vec<ManagedProcess>,
}

impl DaemonState {
    /// An empty document stamped with the current daemon identity.
    pub fn empty() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION.to_string(),
            started_at: epoch_ms(),
            pid: process::id(),
            saved_at: 0,
            processes: Vec::new(),
        }
    }

    /// Verifies every record. Violations are operator-visible but not fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for process in &self.processes {
            if process.id.trim().is_empty() {
                problems.push(format!("process '{}' has an empty id", process.name));
            }
            if process.name.trim().is_empty() {
                problems.push(format!("process {} has an empty name", process.id));
            }
            if process.script.trim().is_empty() {
                problems.push(format!("process '{}' has an empty script", process.name));
            }
            if process.replicas.is_empty() {
                problems.push(format!("process '{}' has no replicas", process.name));
            }
            for replica in &process.replicas {
                if replica.id.trim().is_empty() {
                    problems.push(format!(
                        "process '{}' has a replica with an empty id",
                        process.name
                    ));
                }
            }
        }
        problems
    }
}

/// Reconciles a loaded document against the live OS process table.
///
/// Every replica recorded as running or stopping is probed with signal 0;
/// slots whose pid no longer exists transition to `stopped` with the pid
/// cleared. Returns the number of orphans cleaned up.
pub fn reconcile_orphans(state: &mut DaemonState) -> usize {
    let mut orphans = 0;
    for process in &mut state.processes {
        for replica in &mut process.replicas {
            let tracked = matches!(
                replica.status,
                ReplicaStatus::Running | ReplicaStatus::Stopping
            );
            if !tracked {
                continue;
            }
            let alive = replica
                .pid
                .map(|pid| pid_alive(pid))
                .unwrap_or(false);
            if !alive {
                replica.status = ReplicaStatus::Stopped;
                replica.pid = None;
                replica.uptime_start = None;
                orphans += 1;
            }
        }
        process.reduce_status();
    }
    if orphans > 0 {
        info!("cleaned up {orphans} orphaned replica(s) from persisted state");
    }
    orphans
}

/// Whether `pid` currently refers to a live process.
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

enum StoreMsg {
    Nudge,
    Shutdown,
}

struct PendingState {
    snapshot: Option<DaemonState>,
    dirty: bool,
    last_mutation: Option<Instant>,
}

/// Handle to the persistence worker.
///
/// `save_soon` records the latest snapshot and lets the debounce catch up;
/// `flush` writes synchronously. A reentrancy guard discards a write that
/// would overlap another one in flight.
pub struct StateStore {
    path: PathBuf,
    pending: Arc<Mutex<PendingState>>,
    writing: Arc<AtomicBool>,
    tx: Sender<StoreMsg>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl StateStore {
    /// Creates a store persisting to `path` and spawns its worker thread.
    pub fn new(path: PathBuf) -> Self {
        let pending = Arc::new(Mutex::new(PendingState {
            snapshot: None,
            dirty: false,
            last_mutation: None,
        }));
        let writing = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();

        let worker = {
            let path = path.clone();
            let pending = Arc::clone(&pending);
            let writing = Arc::clone(&writing);
            thread::spawn(move || store_worker(path, pending, writing, rx))
        };

        Self {
            path,
            pending,
            writing,
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The path of the persisted document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted document, or an empty one when the file is
    /// missing or unparseable.
    pub fn load(&self) -> DaemonState {
        match fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<DaemonState>(&raw) {
                Ok(state) => state,
                Err(err) => {
                    warn!(
                        "state file {:?} is not a valid document ({err}); starting empty",
                        self.path
                    );
                    DaemonState::empty()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no state file at {:?}; starting empty", self.path);
                DaemonState::empty()
            }
            Err(err) => {
                warn!("failed to read state file {:?} ({err}); starting empty", self.path);
                DaemonState::empty()
            }
        }
    }

    /// Records a new snapshot for the debounced writer.
    pub fn save_soon(&self, snapshot: DaemonState) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.snapshot = Some(snapshot);
            pending.dirty = true;
            pending.last_mutation = Some(Instant::now());
        }
        let _ = self.tx.send(StoreMsg::Nudge);
    }

    /// Writes `snapshot` synchronously, waiting out any write in flight.
    pub fn flush(&self, snapshot: DaemonState) -> Result<(), StateStoreError> {
        if let Ok(mut pending) = self.pending.lock() {
            pending.snapshot = Some(snapshot.clone());
            pending.dirty = false;
            pending.last_mutation = None;
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if Instant::now() > deadline {
                return Err(StateStoreError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "a state write is stuck in flight",
                )));
            }
            thread::sleep(Duration::from_millis(10));
        }
        let result = write_atomic(&self.path, snapshot);
        self.writing.store(false, Ordering::Release);
        result
    }

    /// Writes a full, non-atomic snapshot to `path` (default
    /// `<state>.backup.<timestamp>`). Returns the path written.
    pub fn backup(
        &self,
        state: &DaemonState,
        path: Option<PathBuf>,
    ) -> Result<PathBuf, StateStoreError> {
        let target = path.unwrap_or_else(|| {
            let name = self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "state.json".to_string());
            self.path
                .with_file_name(format!("{name}.backup.{}", epoch_ms()))
        });
        let mut stamped = state.clone();
        stamped.saved_at = epoch_ms();
        let encoded = serde_json::to_string_pretty(&stamped)?;
        fs::write(&target, encoded)?;
        info!("wrote state backup to {:?}", target);
        Ok(target)
    }

    /// Reads a backup document. Unlike [`StateStore::load`], a missing or
    /// malformed backup is an error.
    pub fn read_backup(&self, path: &Path) -> Result<DaemonState, StateStoreError> {
        if !path.exists() {
            return Err(StateStoreError::BackupNotFound(
                path.to_string_lossy().into_owned(),
            ));
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Stops the worker thread, flushing any dirty snapshot first.
    pub fn shutdown(&self) {
        let _ = self.tx.send(StoreMsg::Shutdown);
        if let Ok(mut worker) = self.worker.lock()
            && let Some(handle) = worker.take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        let _ = self.tx.send(StoreMsg::Shutdown);
    }
}

fn store_worker(
    path: PathBuf,
    pending: Arc<Mutex<PendingState>>,
    writing: Arc<AtomicBool>,
    rx: Receiver<StoreMsg>,
) {
    let mut last_autosave = Instant::now();
    loop {
        let message = rx.recv_timeout(STORE_TICK);
        let shutting_down = matches!(
            message,
            Ok(StoreMsg::Shutdown) | Err(RecvTimeoutError::Disconnected)
        );

        let due = {
            let Ok(mut guard) = pending.lock() else {
                return;
            };
            let debounce_due = guard
                .last_mutation
                .map(|at| at.elapsed() >= SAVE_DEBOUNCE)
                .unwrap_or(false);
            let autosave_due = guard.dirty && last_autosave.elapsed() >= AUTOSAVE_INTERVAL;
            if guard.dirty && (debounce_due || autosave_due || shutting_down) {
                guard.dirty = false;
                guard.last_mutation = None;
                guard.snapshot.clone()
            } else {
                None
            }
        };

        if let Some(snapshot) = due {
            if writing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Err(err) = write_atomic(&path, snapshot) {
                    // The next scheduled save retries with a fresh snapshot.
                    error!("failed to persist daemon state: {err}");
                    if let Ok(mut guard) = pending.lock() {
                        guard.dirty = true;
                    }
                }
                writing.store(false, Ordering::Release);
                last_autosave = Instant::now();
            } else if let Ok(mut guard) = pending.lock() {
                // Another write is in flight; let the debounce catch up.
                guard.dirty = true;
            }
        }

        if shutting_down {
            return;
        }
    }
}

/// Encodes the document and renames it into place. The temporary file is
/// removed on failure.
fn write_atomic(path: &Path, mut state: DaemonState) -> Result<(), StateStoreError> {
    state.saved_at = epoch_ms();
    let encoded = serde_json::to_string_pretty(&state)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".to_string());
    let tmp = path.with_file_name(format!("{file_name}.tmp.{}", process::id()));

    if let Err(err) = fs::write(&tmp, &encoded) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    debug!("persisted daemon state to {:?}", path);
    Ok(())
}
