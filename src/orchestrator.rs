//! Lifecycle orchestration for managed processes and their replicas.
//!
//! The orchestrator owns the `id → ManagedProcess` table, drives every
//! replica FSM, launches and signals OS children, and publishes lifecycle
//! events. All mutating operations serialize on one logical mutex: exactly
//! one of them observes and mutates the table at a time, yielding only at
//! the defined suspension points (spawn, exit waits, store writes).

use std::{
    collections::HashMap,
    path::Path,
    process::{Child, Command, Stdio},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    clock::epoch_ms,
    config::{ProcessConfig, child_environment},
    constants::{
        ADOPTED_POLL_INTERVAL, FORCE_STOP_CLEANUP, START_TIMEOUT, STATE_SCHEMA_VERSION,
        force_kill_timeout, graceful_shutdown_timeout,
    },
    error::DaemonError,
    events::{DaemonEvent, EventBus},
    logs,
    metrics::ProcessSampler,
    process::{
        LaunchMethod, ManagedProcess, ProcessStatus, Replica, ReplicaStatus,
        launch_method,
    },
    restart::{RestartTimers, backoff_delay},
    state::{DaemonState, StateStore, pid_alive, reconcile_orphans},
    watcher::FileWatcher,
};

type ProcessTable = HashMap<String, ManagedProcess>;

/// Per-replica health tuple returned by `health_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaHealth {
    /// Owning process id.
    pub process_id: String,
    /// Owning process name.
    pub process_name: String,
    /// Replica id.
    pub replica_id: String,
    /// OS pid, when live.
    pub pid: Option<u32>,
    /// Replica lifecycle state.
    pub status: ReplicaStatus,
    /// Uptime of the current run in milliseconds.
    pub uptime_ms: Option<u64>,
    /// Sampled CPU usage, when the pid is live.
    pub cpu_percent: Option<f32>,
    /// Sampled resident memory in bytes, when the pid is live.
    pub rss_bytes: Option<u64>,
}

struct Shared {
    table: Mutex<ProcessTable>,
    exited: Condvar,
    events: EventBus,
    store: StateStore,
    timers: RestartTimers,
    sampler: ProcessSampler,
    watcher: FileWatcher,
    watch_routes: Mutex<HashMap<String, Vec<std::path::PathBuf>>>,
    shutting_down: AtomicBool,
    started_at: u64,
}

/// Handle to the supervision engine. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Boots the orchestrator: loads persisted state, reconciles it with
    /// the OS process table, re-attaches to surviving children, and starts
    /// the watch-event router.
    pub fn bootstrap(
        store: StateStore,
        watcher: FileWatcher,
    ) -> Result<Self, DaemonError> {
        let mut state = store.load();
        for problem in state.validate() {
            warn!("persisted state problem: {problem}");
        }
        reconcile_orphans(&mut state);

        let table: ProcessTable = state
            .processes
            .into_iter()
            .map(|process| (process.id.clone(), process))
            .collect();

        let orchestrator = Self {
            shared: Arc::new(Shared {
                table: Mutex::new(table),
                exited: Condvar::new(),
                events: EventBus::new(),
                store,
                timers: RestartTimers::new(),
                sampler: ProcessSampler::new(),
                watcher,
                watch_routes: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
                started_at: epoch_ms(),
            }),
        };

        // Re-attach to children that survived a daemon restart, and put the
        // reconciled view on disk.
        let adopted: Vec<(String, String, u32)> = {
            let table = orchestrator.lock_table()?;
            let found = table
                .values()
                .flat_map(|process| {
                    process.replicas.iter().filter_map(|replica| {
                        replica.pid.map(|pid| {
                            (process.id.clone(), replica.id.clone(), pid)
                        })
                    })
                })
                .collect();
            orchestrator.save_locked(&table);
            found
        };
        for (process_id, replica_id, os_pid) in adopted {
            info!("re-attached to surviving child {os_pid} of process {process_id}");
            orchestrator.spawn_adopted_watcher(process_id, replica_id, os_pid);
        }

        {
            let ids: Vec<String> = {
                let table = orchestrator.lock_table()?;
                table.keys().cloned().collect()
            };
            let table = orchestrator.lock_table()?;
            for id in ids {
                orchestrator.register_watches(&table, &id);
            }
        }
        orchestrator.spawn_watch_router();
        Ok(orchestrator)
    }

    /// The lifecycle event bus.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Whether a shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, ProcessTable>, DaemonError> {
        self.shared.table.lock().map_err(DaemonError::from)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Creates (or relaunches) a process from a validated declaration and
    /// returns its id once every replica is running.
    pub fn start(&self, config: ProcessConfig) -> Result<String, DaemonError> {
        if self.is_shutting_down() {
            return Err(DaemonError::Conflict(
                "daemon is shutting down; refusing new starts".into(),
            ));
        }
        config.validate()?;
        if !Path::new(&config.script).exists() {
            return Err(DaemonError::Validation(format!(
                "script not found: {}",
                config.script
            )));
        }

        let name = config.resolved_name();
        let mut table = self.lock_table()?;

        if let Some(existing_id) = table
            .values()
            .find(|process| process.name == name)
            .map(|process| process.id.clone())
        {
            let process = table
                .get_mut(&existing_id)
                .ok_or_else(|| DaemonError::NotFound(existing_id.clone()))?;
            if !process.is_terminal() {
                return Err(DaemonError::Conflict(format!(
                    "process '{name}' already exists"
                )));
            }
            // A stopped process started again keeps its identity, replica
            // records, and restart counters.
            process.config = config;
            process.script = process.config.script.clone();
            self.relaunch_locked(&mut table, &existing_id)?;
            table = self.wait_all_running(table, &existing_id)?;
            self.register_watches(&table, &existing_id);
            self.save_locked(&table);
            return Ok(existing_id);
        }

        let process = ManagedProcess::from_config(config)?;
        let id = process.id.clone();
        if process.replicas.is_empty() {
            return Err(DaemonError::InvariantViolation(format!(
                "process '{name}' created without replicas"
            )));
        }
        let replica_ids: Vec<String> =
            process.replicas.iter().map(|r| r.id.clone()).collect();
        table.insert(id.clone(), process);

        let mut failure = None;
        for replica_id in &replica_ids {
            if let Err(err) = self.launch_replica_locked(&mut table, &id, replica_id) {
                failure = Some(err);
                break;
            }
        }
        if failure.is_none() {
            table = self.wait_all_running(table, &id)?;
        }
        self.register_watches(&table, &id);
        self.save_locked(&table);
        match failure {
            Some(err) => Err(err),
            None => Ok(id),
        }
    }

    /// Stops every replica of a process. With `force`, skips the graceful
    /// SIGTERM phase and kills immediately.
    pub fn stop(&self, id: &str, force: bool) -> Result<ManagedProcess, DaemonError> {
        let mut table = self.lock_table()?;
        let replica_ids = {
            let process = table
                .get_mut(id)
                .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
            process.status = ProcessStatus::Stopping;
            process.updated_at = epoch_ms();
            process
                .replicas
                .iter()
                .map(|r| r.id.clone())
                .collect::<Vec<_>>()
        };
        for replica_id in &replica_ids {
            self.shared.timers.cancel(replica_id);
        }

        let targets = vec![(id.to_string(), replica_ids)];
        table = self.stop_targets(table, &targets, force)?;

        let snapshot = {
            let process = table
                .get_mut(id)
                .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
            process.reduce_status();
            process.updated_at = epoch_ms();
            process.clone()
        };
        self.save_locked(&table);
        Ok(snapshot)
    }

    /// Stops and relaunches a process with its full declared replica count.
    pub fn restart(&self, id: &str) -> Result<ManagedProcess, DaemonError> {
        if self.is_shutting_down() {
            return Err(DaemonError::Conflict(
                "daemon is shutting down; refusing restarts".into(),
            ));
        }
        let mut table = self.lock_table()?;
        let replica_ids = {
            let process = table
                .get_mut(id)
                .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
            process.status = ProcessStatus::Reloading;
            process.updated_at = epoch_ms();
            process
                .replicas
                .iter()
                .map(|r| r.id.clone())
                .collect::<Vec<_>>()
        };
        for replica_id in &replica_ids {
            self.shared.timers.cancel(replica_id);
        }

        let targets = vec![(id.to_string(), replica_ids)];
        table = self.stop_targets(table, &targets, false)?;
        self.relaunch_locked(&mut table, id)?;
        table = self.wait_all_running(table, id)?;

        let snapshot = {
            let process = table
                .get_mut(id)
                .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
            process.reduce_status();
            process.updated_at = epoch_ms();
            process.clone()
        };
        self.shared.events.publish(DaemonEvent::Restarted {
            process_id: id.to_string(),
            timestamp: epoch_ms(),
        });
        self.save_locked(&table);
        Ok(snapshot)
    }

    /// Removes a process. Refused while any replica is non-terminal.
    pub fn delete(&self, id: &str) -> Result<(), DaemonError> {
        let mut table = self.lock_table()?;
        let replica_ids = {
            let process = table
                .get(id)
                .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
            if !process.is_terminal() {
                return Err(DaemonError::Conflict(format!(
                    "process '{}' has active replicas; stop it before deleting",
                    process.name
                )));
            }
            process
                .replicas
                .iter()
                .map(|r| r.id.clone())
                .collect::<Vec<_>>()
        };
        for replica_id in &replica_ids {
            self.shared.timers.cancel(replica_id);
        }
        table.remove(id);
        if let Ok(mut routes) = self.shared.watch_routes.lock() {
            routes.remove(id);
        }
        self.shared.events.publish(DaemonEvent::Deleted {
            process_id: id.to_string(),
            timestamp: epoch_ms(),
        });
        self.save_locked(&table);
        Ok(())
    }

    /// Best-effort restart of every running process. Per-process failures
    /// are logged, never propagated.
    pub fn reload_all(&self) -> usize {
        let ids: Vec<String> = match self.lock_table() {
            Ok(table) => table
                .values()
                .filter(|process| process.status == ProcessStatus::Running)
                .map(|process| process.id.clone())
                .collect(),
            Err(_) => return 0,
        };
        let mut reloaded = 0;
        for id in ids {
            match self.restart(&id) {
                Ok(_) => reloaded += 1,
                Err(err) => warn!("reload of process {id} failed: {err}"),
            }
        }
        self.shared.events.publish(DaemonEvent::Reloaded {
            count: reloaded,
            timestamp: epoch_ms(),
        });
        reloaded
    }

    /// Stops everything, cancels timers, flushes the store, and blocks
    /// further starts. Idempotent: later calls are no-ops.
    pub fn shutdown(&self) -> Result<(), DaemonError> {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down: stopping all managed processes");
        self.shared.events.publish(DaemonEvent::ShuttingDown {
            timestamp: epoch_ms(),
        });
        self.shared.timers.cancel_all();
        self.shared.watcher.pause();

        let mut table = self.lock_table()?;
        let targets: Vec<(String, Vec<String>)> = table
            .values_mut()
            .filter(|process| !process.is_terminal())
            .map(|process| {
                process.status = ProcessStatus::Stopping;
                (
                    process.id.clone(),
                    process.replicas.iter().map(|r| r.id.clone()).collect(),
                )
            })
            .collect();

        table = self.stop_targets(table, &targets, false)?;
        for (process_id, _) in &targets {
            if let Some(process) = table.get_mut(process_id) {
                process.reduce_status();
                process.updated_at = epoch_ms();
            }
        }

        let snapshot = self.snapshot(&table);
        drop(table);
        self.shared.store.flush(snapshot)?;
        self.shared.store.shutdown();
        Ok(())
    }

    /// Snapshot of every process, ordered by creation time.
    pub fn list(&self) -> Vec<ManagedProcess> {
        let Ok(table) = self.lock_table() else {
            return Vec::new();
        };
        let mut processes: Vec<ManagedProcess> = table.values().cloned().collect();
        processes.sort_by_key(|process| (process.created_at, process.id.clone()));
        processes
    }

    /// Snapshot of one process by id.
    pub fn get(&self, id: &str) -> Option<ManagedProcess> {
        self.lock_table().ok()?.get(id).cloned()
    }

    /// Snapshot of one process by name.
    pub fn get_by_name(&self, name: &str) -> Option<ManagedProcess> {
        self.lock_table()
            .ok()?
            .values()
            .find(|process| process.name == name)
            .cloned()
    }

    /// Resolves an id-or-name reference to a process id.
    pub fn resolve(&self, target: &str) -> Result<String, DaemonError> {
        let table = self.lock_table()?;
        if table.contains_key(target) {
            return Ok(target.to_string());
        }
        table
            .values()
            .find(|process| process.name == target)
            .map(|process| process.id.clone())
            .ok_or_else(|| DaemonError::NotFound(target.to_string()))
    }

    /// Per-replica health, sampled from the live OS processes.
    pub fn health_check(&self) -> Vec<ReplicaHealth> {
        let now = epoch_ms();
        let rows: Vec<ReplicaHealth> = match self.lock_table() {
            Ok(table) => table
                .values()
                .flat_map(|process| {
                    process.replicas.iter().map(|replica| ReplicaHealth {
                        process_id: process.id.clone(),
                        process_name: process.name.clone(),
                        replica_id: replica.id.clone(),
                        pid: replica.pid,
                        status: replica.status,
                        uptime_ms: replica.uptime_ms(now),
                        cpu_percent: None,
                        rss_bytes: None,
                    })
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        // Sampling happens outside the table lock.
        rows.into_iter()
            .map(|mut row| {
                if let Some(pid) = row.pid
                    && let Some(sample) = self.shared.sampler.sample(pid)
                {
                    row.cpu_percent = Some(sample.cpu_percent);
                    row.rss_bytes = Some(sample.rss_bytes);
                }
                row
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Launching
    // ------------------------------------------------------------------

    fn launch_replica_locked(
        &self,
        table: &mut ProcessTable,
        process_id: &str,
        replica_id: &str,
    ) -> Result<(), DaemonError> {
        let process = table
            .get_mut(process_id)
            .ok_or_else(|| DaemonError::NotFound(process_id.to_string()))?;
        let config = process.config.clone();
        let replica_index = process
            .replicas
            .iter()
            .position(|r| r.id == replica_id)
            .ok_or_else(|| {
                DaemonError::InvariantViolation(format!(
                    "replica {replica_id} missing from process {process_id}"
                ))
            })?;

        let mut command = build_command(&config, replica_index);
        match command.spawn() {
            Ok(mut child) => {
                let os_pid = child.id();
                if let Some(stdout) = child.stdout.take() {
                    logs::spawn_output_writer(process_id.to_string(), stdout);
                }
                if let Some(stderr) = child.stderr.take() {
                    logs::spawn_output_writer(process_id.to_string(), stderr);
                }

                let now = epoch_ms();
                if let Some(replica) = process.replica_mut(replica_id) {
                    replica.pid = Some(os_pid);
                    replica.status = ReplicaStatus::Running;
                    replica.uptime_start = Some(now);
                }
                process.reduce_status();
                process.updated_at = now;
                info!(
                    "started replica {replica_id} of '{}' (pid {os_pid})",
                    process.name
                );
                self.shared.events.publish(DaemonEvent::Started {
                    process_id: process_id.to_string(),
                    replica_id: replica_id.to_string(),
                    pid: os_pid,
                    timestamp: now,
                });
                self.spawn_exit_watcher(
                    process_id.to_string(),
                    replica_id.to_string(),
                    child,
                );
                Ok(())
            }
            Err(err) => {
                let now = epoch_ms();
                if let Some(replica) = process.replica_mut(replica_id) {
                    replica.pid = None;
                    replica.status = ReplicaStatus::Errored;
                    replica.uptime_start = None;
                }
                process.reduce_status();
                process.updated_at = now;
                self.shared.events.publish(DaemonEvent::Errored {
                    process_id: process_id.to_string(),
                    replica_id: replica_id.to_string(),
                    timestamp: now,
                });
                Err(DaemonError::SpawnFailure {
                    script: config.script,
                    source: err,
                })
            }
        }
    }

    /// Resets a process's replica slots to the declared count and launches
    /// them all. Existing slots (and their restart counters) are reused.
    fn relaunch_locked(
        &self,
        table: &mut ProcessTable,
        process_id: &str,
    ) -> Result<(), DaemonError> {
        let replica_ids = {
            let process = table
                .get_mut(process_id)
                .ok_or_else(|| DaemonError::NotFound(process_id.to_string()))?;
            let desired = process.config.instances.resolve()?;
            process.replicas.truncate(desired);
            while process.replicas.len() < desired {
                process.replicas.push(Replica::new());
            }
            let now = epoch_ms();
            for replica in &mut process.replicas {
                replica.status = ReplicaStatus::Starting;
                replica.pid = None;
                replica.uptime_start = None;
                replica.last_restart = Some(now);
            }
            process.updated_at = now;
            process
                .replicas
                .iter()
                .map(|r| r.id.clone())
                .collect::<Vec<_>>()
        };
        for replica_id in &replica_ids {
            self.launch_replica_locked(table, process_id, replica_id)?;
        }
        Ok(())
    }

    /// Waits until no replica of the process is still `starting`.
    fn wait_all_running<'a>(
        &self,
        guard: MutexGuard<'a, ProcessTable>,
        process_id: &str,
    ) -> Result<MutexGuard<'a, ProcessTable>, DaemonError> {
        let (guard, result) = self
            .shared
            .exited
            .wait_timeout_while(guard, START_TIMEOUT, |table| {
                table
                    .get(process_id)
                    .map(|process| {
                        process
                            .replicas
                            .iter()
                            .any(|r| r.status == ReplicaStatus::Starting)
                    })
                    .unwrap_or(false)
            })
            .map_err(|err| DaemonError::MutexPoison(err.to_string()))?;
        if result.timed_out() {
            let name = guard
                .get(process_id)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| process_id.to_string());
            return Err(DaemonError::StartTimeout {
                process: name,
                timeout_ms: START_TIMEOUT.as_millis() as u64,
            });
        }
        Ok(guard)
    }

    fn spawn_exit_watcher(&self, process_id: String, replica_id: String, mut child: Child) {
        let orchestrator = self.clone();
        thread::spawn(move || {
            let status = child.wait().ok();
            orchestrator.handle_exit(&process_id, &replica_id, status);
        });
    }

    /// Polls an adopted (re-attached) child until it disappears, then
    /// feeds the exit into the normal accounting path.
    fn spawn_adopted_watcher(&self, process_id: String, replica_id: String, os_pid: u32) {
        let orchestrator = self.clone();
        thread::spawn(move || {
            loop {
                thread::sleep(ADOPTED_POLL_INTERVAL);
                if orchestrator.is_shutting_down() {
                    return;
                }
                let tracked = orchestrator.get(&process_id).and_then(|process| {
                    process.replica(&replica_id).map(|replica| {
                        replica.pid == Some(os_pid)
                            && matches!(
                                replica.status,
                                ReplicaStatus::Running | ReplicaStatus::Stopping
                            )
                    })
                });
                if tracked != Some(true) {
                    return;
                }
                if !pid_alive(os_pid) {
                    // The exit status of an adopted child is unknowable;
                    // treat the disappearance as a crash.
                    orchestrator.handle_exit(&process_id, &replica_id, None);
                    return;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Exit accounting
    // ------------------------------------------------------------------

    fn handle_exit(
        &self,
        process_id: &str,
        replica_id: &str,
        status: Option<std::process::ExitStatus>,
    ) {
        let Ok(mut table) = self.shared.table.lock() else {
            return;
        };
        let now = epoch_ms();
        let mut pending_restart: Option<(String, u64)> = None;

        {
            let Some(process) = table.get_mut(process_id) else {
                self.shared.exited.notify_all();
                return;
            };
            let config = process.config.clone();
            let name = process.name.clone();
            let Some(replica) = process.replica_mut(replica_id) else {
                self.shared.exited.notify_all();
                return;
            };

            let code = status.as_ref().and_then(|s| s.code());
            #[cfg(unix)]
            let term_signal = status.as_ref().and_then(|s| s.signal());
            #[cfg(not(unix))]
            let term_signal = None;
            let uptime = replica.uptime_ms(now);

            replica.pid = None;
            self.shared.events.publish(DaemonEvent::Exited {
                process_id: process_id.to_string(),
                replica_id: replica_id.to_string(),
                code,
                signal: term_signal,
                timestamp: now,
            });

            match replica.status {
                ReplicaStatus::Stopping => {
                    replica.status = ReplicaStatus::Stopped;
                    replica.uptime_start = None;
                    self.shared.events.publish(DaemonEvent::Stopped {
                        process_id: process_id.to_string(),
                        replica_id: replica_id.to_string(),
                        timestamp: now,
                    });
                }
                ReplicaStatus::Running | ReplicaStatus::Starting => {
                    replica.uptime_start = None;
                    if code == Some(0) {
                        info!("replica {replica_id} of '{name}' exited cleanly");
                        replica.status = ReplicaStatus::Stopped;
                        self.shared.events.publish(DaemonEvent::Stopped {
                            process_id: process_id.to_string(),
                            replica_id: replica_id.to_string(),
                            timestamp: now,
                        });
                    } else {
                        // A long stable run earns the slot a fresh restart
                        // budget before the new attempt is accounted.
                        if uptime.map(|up| up >= config.min_uptime).unwrap_or(false) {
                            replica.restarts = 0;
                        }
                        warn!(
                            "replica {replica_id} of '{name}' crashed \
                             (code {code:?}, signal {term_signal:?})"
                        );
                        self.shared.events.publish(DaemonEvent::Crashed {
                            process_id: process_id.to_string(),
                            replica_id: replica_id.to_string(),
                            restarts: replica.restarts,
                            timestamp: now,
                        });

                        if !self.is_shutting_down()
                            && replica.restarts < config.max_restarts
                        {
                            let delay = backoff_delay(
                                replica.restarts,
                                config.restart_delay_ms(),
                                config.max_restart_delay_ms(),
                            );
                            replica.restarts += 1;
                            replica.last_restart = Some(now);
                            replica.status = ReplicaStatus::Crashed;
                            pending_restart = Some((replica.id.clone(), delay));
                            self.shared.events.publish(
                                DaemonEvent::RestartScheduled {
                                    process_id: process_id.to_string(),
                                    replica_id: replica_id.to_string(),
                                    delay_ms: delay,
                                    timestamp: now,
                                },
                            );
                        } else {
                            replica.status = ReplicaStatus::Errored;
                            warn!(
                                "replica {replica_id} of '{name}' exhausted its \
                                 restart budget"
                            );
                            self.shared.events.publish(DaemonEvent::Errored {
                                process_id: process_id.to_string(),
                                replica_id: replica_id.to_string(),
                                timestamp: now,
                            });
                        }
                    }
                }
                // Already accounted for by a stop or a previous exit.
                ReplicaStatus::Stopped
                | ReplicaStatus::Errored
                | ReplicaStatus::Crashed => {}
            }

            let mid_stop = process.status == ProcessStatus::Stopping
                && !process.is_terminal();
            if !mid_stop {
                process.reduce_status();
            }
            process.updated_at = now;
        }

        self.save_locked(&table);
        self.shared.exited.notify_all();
        drop(table);

        if let Some((replica_id, delay)) = pending_restart {
            let orchestrator = self.clone();
            let process_key = process_id.to_string();
            let replica_key = replica_id.clone();
            self.shared.timers.schedule(
                &replica_id,
                Duration::from_millis(delay),
                move || {
                    orchestrator.execute_scheduled_restart(&process_key, &replica_key);
                },
            );
        }
    }

    /// Runs when a backoff timer fires. Re-validates that the slot is
    /// still crashed; a stop or delete that raced the timer wins.
    fn execute_scheduled_restart(&self, process_id: &str, replica_id: &str) {
        if self.is_shutting_down() {
            return;
        }
        let Ok(mut table) = self.shared.table.lock() else {
            return;
        };
        {
            let Some(process) = table.get_mut(process_id) else {
                return;
            };
            let Some(replica) = process.replica_mut(replica_id) else {
                return;
            };
            if replica.status != ReplicaStatus::Crashed {
                return;
            }
            replica.status = ReplicaStatus::Starting;
        }
        if let Err(err) = self.launch_replica_locked(&mut table, process_id, replica_id)
        {
            warn!("automatic restart of process {process_id} failed: {err}");
        }
        self.save_locked(&table);
        self.shared.exited.notify_all();
    }

    // ------------------------------------------------------------------
    // Stop protocol
    // ------------------------------------------------------------------

    /// Drives the stop protocol for the given `(process, replicas)` set:
    /// signal, wait, escalate, and finalize. Each replica transitions to
    /// `stopped` exactly once.
    fn stop_targets<'a>(
        &self,
        mut guard: MutexGuard<'a, ProcessTable>,
        targets: &[(String, Vec<String>)],
        force: bool,
    ) -> Result<MutexGuard<'a, ProcessTable>, DaemonError> {
        let first_signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        self.signal_targets_locked(&mut guard, targets, first_signal);

        let timeout = if force {
            FORCE_STOP_CLEANUP
        } else {
            graceful_shutdown_timeout()
        };
        guard = self.wait_targets_stopped(guard, targets, timeout)?;

        if !force {
            let stragglers = collect_stragglers(&guard, targets);
            if !stragglers.is_empty() {
                warn!(
                    "{} replica(s) ignored SIGTERM; escalating to SIGKILL",
                    stragglers.len()
                );
                for (_, _, os_pid) in &stragglers {
                    if let Err(err) = signal_group(*os_pid, Signal::SIGKILL)
                        && err != Errno::ESRCH
                    {
                        warn!("failed to SIGKILL process group {os_pid}: {err}");
                    }
                }
                guard = self.wait_targets_stopped(guard, targets, force_kill_timeout())?;
            }
        }

        self.finalize_targets_locked(&mut guard, targets);
        Ok(guard)
    }

    fn signal_targets_locked(
        &self,
        table: &mut ProcessTable,
        targets: &[(String, Vec<String>)],
        signal: Signal,
    ) {
        let now = epoch_ms();
        for (process_id, replica_ids) in targets {
            let Some(process) = table.get_mut(process_id) else {
                continue;
            };
            for replica in process
                .replicas
                .iter_mut()
                .filter(|r| replica_ids.contains(&r.id))
            {
                if replica.status == ReplicaStatus::Stopped {
                    continue;
                }
                let live = matches!(
                    replica.status,
                    ReplicaStatus::Running
                        | ReplicaStatus::Starting
                        | ReplicaStatus::Stopping
                );
                if live && let Some(os_pid) = replica.pid {
                    replica.status = ReplicaStatus::Stopping;
                    match signal_group(os_pid, signal) {
                        Ok(()) => {}
                        Err(Errno::ESRCH) => {
                            // Already gone; account the stop right here.
                            replica.status = ReplicaStatus::Stopped;
                            replica.pid = None;
                            replica.uptime_start = None;
                            self.shared.events.publish(DaemonEvent::Stopped {
                                process_id: process_id.clone(),
                                replica_id: replica.id.clone(),
                                timestamp: now,
                            });
                        }
                        Err(err) => {
                            warn!("failed to signal process group {os_pid}: {err}");
                        }
                    }
                } else {
                    // Crashed, errored, or never launched: nothing to wait on.
                    replica.status = ReplicaStatus::Stopped;
                    replica.pid = None;
                    replica.uptime_start = None;
                    self.shared.events.publish(DaemonEvent::Stopped {
                        process_id: process_id.clone(),
                        replica_id: replica.id.clone(),
                        timestamp: now,
                    });
                }
            }
        }
    }

    fn wait_targets_stopped<'a>(
        &self,
        guard: MutexGuard<'a, ProcessTable>,
        targets: &[(String, Vec<String>)],
        timeout: Duration,
    ) -> Result<MutexGuard<'a, ProcessTable>, DaemonError> {
        let (guard, _result) = self
            .shared
            .exited
            .wait_timeout_while(guard, timeout, |table| {
                targets.iter().any(|(process_id, replica_ids)| {
                    table
                        .get(process_id)
                        .map(|process| {
                            process.replicas.iter().any(|r| {
                                replica_ids.contains(&r.id)
                                    && r.status == ReplicaStatus::Stopping
                            })
                        })
                        .unwrap_or(false)
                })
            })
            .map_err(|err| DaemonError::MutexPoison(err.to_string()))?;
        Ok(guard)
    }

    fn finalize_targets_locked(
        &self,
        table: &mut ProcessTable,
        targets: &[(String, Vec<String>)],
    ) {
        let now = epoch_ms();
        for (process_id, replica_ids) in targets {
            let Some(process) = table.get_mut(process_id) else {
                continue;
            };
            for replica in process
                .replicas
                .iter_mut()
                .filter(|r| replica_ids.contains(&r.id))
            {
                if replica.status != ReplicaStatus::Stopped {
                    replica.status = ReplicaStatus::Stopped;
                    replica.pid = None;
                    replica.uptime_start = None;
                    self.shared.events.publish(DaemonEvent::Stopped {
                        process_id: process_id.clone(),
                        replica_id: replica.id.clone(),
                        timestamp: now,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Watching and persistence
    // ------------------------------------------------------------------

    fn register_watches(&self, table: &ProcessTable, process_id: &str) {
        let Some(process) = table.get(process_id) else {
            return;
        };
        let paths = process
            .config
            .watch
            .watch_paths(Path::new(&process.config.script));
        if paths.is_empty() {
            return;
        }
        if let Err(err) = self.shared.watcher.watch(&paths) {
            warn!("failed to watch paths for '{}': {err}", process.name);
            return;
        }
        if let Ok(mut routes) = self.shared.watch_routes.lock() {
            routes.insert(process_id.to_string(), paths);
        }
    }

    fn spawn_watch_router(&self) {
        let rx = self.shared.watcher.subscribe();
        let orchestrator = self.clone();
        thread::spawn(move || {
            for event in rx {
                if orchestrator.is_shutting_down() {
                    return;
                }
                let targets: Vec<String> = orchestrator
                    .shared
                    .watch_routes
                    .lock()
                    .map(|routes| {
                        routes
                            .iter()
                            .filter(|(_, roots)| {
                                roots.iter().any(|root| event.path.starts_with(root))
                            })
                            .map(|(id, _)| id.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                for process_id in targets {
                    info!(
                        "detected {:?} at {:?}; restarting process {process_id}",
                        event.kind, event.path
                    );
                    orchestrator.shared.events.publish(DaemonEvent::Log {
                        process_id: process_id.clone(),
                        line: format!("file change at {}", event.path.display()),
                        timestamp: epoch_ms(),
                    });
                    if let Err(err) = orchestrator.restart(&process_id) {
                        warn!(
                            "watch-triggered restart of {process_id} failed: {err}"
                        );
                    }
                }
            }
        });
    }

    fn snapshot(&self, table: &ProcessTable) -> DaemonState {
        let mut processes: Vec<ManagedProcess> = table.values().cloned().collect();
        processes.sort_by_key(|process| (process.created_at, process.id.clone()));
        DaemonState {
            version: STATE_SCHEMA_VERSION.to_string(),
            started_at: self.shared.started_at,
            pid: std::process::id(),
            saved_at: 0,
            processes,
        }
    }

    fn save_locked(&self, table: &ProcessTable) {
        self.shared.store.save_soon(self.snapshot(table));
    }

    // ------------------------------------------------------------------
    // Backup and restore
    // ------------------------------------------------------------------

    /// Writes a full snapshot next to the state file (or to `path`).
    pub fn backup(
        &self,
        path: Option<std::path::PathBuf>,
    ) -> Result<std::path::PathBuf, DaemonError> {
        let table = self.lock_table()?;
        let snapshot = self.snapshot(&table);
        Ok(self.shared.store.backup(&snapshot, path)?)
    }

    /// Replaces the in-memory view with a backup document, reconciles it
    /// against the OS process table, and forces a save.
    pub fn restore(&self, path: &Path) -> Result<usize, DaemonError> {
        let mut restored = self.shared.store.read_backup(path)?;
        let orphans = reconcile_orphans(&mut restored);
        let mut table = self.lock_table()?;
        *table = restored
            .processes
            .into_iter()
            .map(|process| (process.id.clone(), process))
            .collect();
        let snapshot = self.snapshot(&table);
        drop(table);
        self.shared.store.flush(snapshot)?;
        Ok(orphans)
    }

    /// Discards every process record.
    pub fn reset(&self) -> Result<(), DaemonError> {
        let mut table = self.lock_table()?;
        table.clear();
        let snapshot = self.snapshot(&table);
        drop(table);
        self.shared.store.flush(snapshot)?;
        Ok(())
    }
}

/// Builds the launch command for a replica slot.
///
/// All three launch methods exec the interpreter with the script; cluster
/// workers additionally learn their slot index through the environment.
fn build_command(config: &ProcessConfig, replica_index: usize) -> Command {
    let method = launch_method(config);
    let mut command = Command::new(config.resolved_interpreter());
    command.arg(&config.script);
    command.args(&config.args);
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }
    command.env_clear();
    command.envs(child_environment(&config.env));
    if method == LaunchMethod::Cluster {
        command.env("NODE_APP_INSTANCE", replica_index.to_string());
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    #[cfg(unix)]
    {
        command.process_group(0);
        let sigset = crate::signals::control_sigset();
        // The daemon blocks its control signals; children must not inherit
        // the mask or they become unstoppable via SIGTERM.
        unsafe {
            command.pre_exec(move || {
                let _ = sigset.thread_unblock();
                Ok(())
            });
        }
    }
    command
}

fn signal_group(os_pid: u32, signal: Signal) -> Result<(), Errno> {
    kill(Pid::from_raw(-(os_pid as i32)), signal)
}

fn collect_stragglers(
    table: &ProcessTable,
    targets: &[(String, Vec<String>)],
) -> Vec<(String, String, u32)> {
    let mut stragglers = Vec::new();
    for (process_id, replica_ids) in targets {
        let Some(process) = table.get(process_id) else {
            continue;
        };
        for replica in &process.replicas {
            if replica_ids.contains(&replica.id)
                && replica.status == ReplicaStatus::Stopping
                && let Some(os_pid) = replica.pid
            {
                stragglers.push((process_id.clone(), replica.id.clone(), os_pid));
            }
        }
    }
    stragglers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Instances;
    use std::{fs, path::PathBuf, time::Instant};
    use tempfile::{TempDir, tempdir};

    struct Harness {
        orchestrator: Orchestrator,
        dir: TempDir,
        _home: crate::test_utils::HomeGuard,
    }

    fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let home = crate::test_utils::HomeGuard::set(&dir.path().join("home"));
        crate::runtime::ensure_layout().expect("layout");
        let store = StateStore::new(dir.path().join("state.json"));
        let watcher = FileWatcher::new().expect("watcher");
        let orchestrator = Orchestrator::bootstrap(store, watcher).expect("bootstrap");
        Harness {
            orchestrator,
            dir,
            _home: home,
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("script");
        path
    }

    fn sh_config(script: &Path) -> ProcessConfig {
        let mut config = ProcessConfig::new(script.to_string_lossy().into_owned());
        config.interpreter = Some("sh".into());
        config
    }

    fn wait_for<F>(orchestrator: &Orchestrator, id: &str, timeout: Duration, check: F)
    where
        F: Fn(&ManagedProcess) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(process) = orchestrator.get(id)
                && check(&process)
            {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "condition not reached for process {id}: {:?}",
                orchestrator.get(id)
            );
            thread::sleep(Duration::from_millis(25));
        }
    }

    #[test]
    fn start_and_stop_single_replica() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let mut config = sh_config(&script);
        config.name = Some("web".into());

        let id = h.orchestrator.start(config).expect("start");
        let process = h.orchestrator.get(&id).expect("snapshot");
        assert_eq!(process.status, ProcessStatus::Running);
        assert_eq!(process.replicas.len(), 1);
        assert!(process.replicas[0].pid.is_some());

        let stopped = h.orchestrator.stop(&id, false).expect("stop");
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert!(stopped.replicas[0].pid.is_none());
    }

    #[test]
    fn duplicate_name_is_a_conflict() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let mut config = sh_config(&script);
        config.name = Some("web".into());

        let id = h.orchestrator.start(config.clone()).expect("start");
        assert!(matches!(
            h.orchestrator.start(config),
            Err(DaemonError::Conflict(_))
        ));
        h.orchestrator.stop(&id, true).expect("stop");
    }

    #[test]
    fn start_refused_while_shutting_down() {
        let h = harness();
        h.orchestrator.shutdown().expect("shutdown");
        let script = write_script(h.dir.path(), "a.sh", "sleep 1\n");
        assert!(matches!(
            h.orchestrator.start(sh_config(&script)),
            Err(DaemonError::Conflict(_))
        ));
        // Idempotent.
        h.orchestrator.shutdown().expect("second shutdown");
    }

    #[test]
    fn missing_script_is_a_validation_error() {
        let h = harness();
        let config = sh_config(&h.dir.path().join("absent.sh"));
        assert!(matches!(
            h.orchestrator.start(config),
            Err(DaemonError::Validation(_))
        ));
    }

    #[test]
    fn crash_restarts_until_budget_exhausted() {
        let h = harness();
        let script = write_script(h.dir.path(), "crash.sh", "exit 7\n");
        let mut config = sh_config(&script);
        config.name = Some("crasher".into());
        config.max_restarts = 2;
        config.restart_delay = 40;
        config.max_restart_delay = 200;

        let id = h.orchestrator.start(config).expect("start");
        // Wait on the replica state: the process-level status also reads
        // `errored` transiently while a crashed replica awaits its timer.
        wait_for(&h.orchestrator, &id, Duration::from_secs(10), |process| {
            process.replicas[0].status == ReplicaStatus::Errored
        });

        let process = h.orchestrator.get(&id).expect("snapshot");
        assert_eq!(process.status, ProcessStatus::Errored);
        let replica = &process.replicas[0];
        assert_eq!(replica.restarts, 2);
        assert!(replica.last_restart.is_some());

        // Errored processes stay down.
        thread::sleep(Duration::from_millis(400));
        let process = h.orchestrator.get(&id).expect("snapshot");
        assert_eq!(process.status, ProcessStatus::Errored);
    }

    #[test]
    fn clean_exit_is_stopped_not_crashed() {
        let h = harness();
        let script = write_script(h.dir.path(), "oneshot.sh", "exit 0\n");
        let id = h.orchestrator.start(sh_config(&script)).expect("start");
        wait_for(&h.orchestrator, &id, Duration::from_secs(5), |process| {
            process.status == ProcessStatus::Stopped
        });
        let process = h.orchestrator.get(&id).expect("snapshot");
        assert_eq!(process.replicas[0].restarts, 0);
    }

    #[test]
    fn delete_refused_while_running_then_allowed() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let id = h.orchestrator.start(sh_config(&script)).expect("start");

        assert!(matches!(
            h.orchestrator.delete(&id),
            Err(DaemonError::Conflict(_))
        ));

        h.orchestrator.stop(&id, true).expect("stop");
        h.orchestrator.delete(&id).expect("delete");
        assert!(h.orchestrator.get(&id).is_none());
        assert!(matches!(
            h.orchestrator.delete(&id),
            Err(DaemonError::NotFound(_))
        ));
    }

    #[test]
    fn stop_then_start_preserves_slots_and_counters() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let mut config = sh_config(&script);
        config.name = Some("web".into());
        config.instances = Instances::Count(2);

        let id = h.orchestrator.start(config.clone()).expect("start");
        let before = h.orchestrator.get(&id).expect("snapshot");
        assert_eq!(before.replicas.len(), 2);
        let slot_ids: Vec<String> =
            before.replicas.iter().map(|r| r.id.clone()).collect();

        h.orchestrator.stop(&id, true).expect("stop");
        let restarted_id = h.orchestrator.start(config).expect("restart via start");
        assert_eq!(restarted_id, id);

        let after = h.orchestrator.get(&id).expect("snapshot");
        assert_eq!(after.status, ProcessStatus::Running);
        assert_eq!(after.replicas.len(), 2);
        let after_ids: Vec<String> =
            after.replicas.iter().map(|r| r.id.clone()).collect();
        assert_eq!(slot_ids, after_ids);
        assert!(after.replicas.iter().all(|r| r.restarts == 0));

        h.orchestrator.stop(&id, true).expect("final stop");
    }

    #[test]
    fn restart_relaunches_full_replica_count() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let mut config = sh_config(&script);
        config.instances = Instances::Count(3);

        let id = h.orchestrator.start(config).expect("start");
        let restarted = h.orchestrator.restart(&id).expect("restart");
        assert_eq!(restarted.status, ProcessStatus::Running);
        assert_eq!(restarted.replicas.len(), 3);
        assert!(restarted.replicas.iter().all(|r| r.pid.is_some()));

        h.orchestrator.stop(&id, true).expect("stop");
    }

    #[test]
    fn lookup_by_name_and_resolution() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let mut config = sh_config(&script);
        config.name = Some("lookup-me".into());

        let id = h.orchestrator.start(config).expect("start");
        assert_eq!(
            h.orchestrator.get_by_name("lookup-me").map(|p| p.id),
            Some(id.clone())
        );
        assert_eq!(h.orchestrator.resolve("lookup-me").unwrap(), id);
        assert_eq!(h.orchestrator.resolve(&id).unwrap(), id);
        assert!(matches!(
            h.orchestrator.resolve("nope"),
            Err(DaemonError::NotFound(_))
        ));
        assert_eq!(h.orchestrator.list().len(), 1);

        h.orchestrator.stop(&id, true).expect("stop");
    }

    #[test]
    fn health_check_samples_running_replicas() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let id = h.orchestrator.start(sh_config(&script)).expect("start");

        let health = h.orchestrator.health_check();
        assert_eq!(health.len(), 1);
        let row = &health[0];
        assert_eq!(row.process_id, id);
        assert_eq!(row.status, ReplicaStatus::Running);
        assert!(row.pid.is_some());
        assert!(row.uptime_ms.is_some());

        h.orchestrator.stop(&id, true).expect("stop");
    }

    #[test]
    fn shutdown_stops_everything_and_flushes() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let id_a = h.orchestrator.start(sh_config(&script)).expect("a");
        let script_b = write_script(h.dir.path(), "other.sh", "sleep 30\n");
        let mut config_b = sh_config(&script_b);
        config_b.name = Some("other".into());
        let id_b = h.orchestrator.start(config_b).expect("b");

        h.orchestrator.shutdown().expect("shutdown");

        for id in [id_a, id_b] {
            let process = h.orchestrator.get(&id).expect("snapshot");
            assert_eq!(process.status, ProcessStatus::Stopped);
            assert!(process.replicas.iter().all(|r| r.pid.is_none()));
        }

        // The flushed document is on disk and parses.
        let raw = fs::read_to_string(h.dir.path().join("state.json")).expect("state");
        let state: DaemonState = serde_json::from_str(&raw).expect("document");
        assert_eq!(state.processes.len(), 2);
    }

    #[test]
    fn backup_restore_and_reset() {
        let h = harness();
        let script = write_script(h.dir.path(), "server.sh", "sleep 30\n");
        let id = h.orchestrator.start(sh_config(&script)).expect("start");
        h.orchestrator.stop(&id, true).expect("stop");

        let backup = h.orchestrator.backup(None).expect("backup");
        h.orchestrator.reset().expect("reset");
        assert!(h.orchestrator.list().is_empty());

        h.orchestrator.restore(&backup).expect("restore");
        let restored = h.orchestrator.list();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, id);
    }
}
