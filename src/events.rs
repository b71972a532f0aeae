//! Typed lifecycle events and their broadcast channel.
//!
//! Every state transition in the orchestrator is published as a
//! [`DaemonEvent`]. Subscribers (the log sink, connected control streams)
//! each hold their own receiver; a lagging or dropped subscriber never
//! blocks publication.

use std::sync::{
    Arc, Mutex,
    mpsc::{Receiver, Sender, channel},
};

use serde::Serialize;

/// A lifecycle event with its subject and timestamp (epoch milliseconds).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DaemonEvent {
    /// A replica reached `running`.
    Started {
        process_id: String,
        replica_id: String,
        pid: u32,
        timestamp: u64,
    },
    /// A child exited; `code`/`signal` as reported by the OS.
    Exited {
        process_id: String,
        replica_id: String,
        code: Option<i32>,
        signal: Option<i32>,
        timestamp: u64,
    },
    /// A child exited unexpectedly.
    Crashed {
        process_id: String,
        replica_id: String,
        restarts: u32,
        timestamp: u64,
    },
    /// A backoff timer was armed for a crashed replica.
    RestartScheduled {
        process_id: String,
        replica_id: String,
        delay_ms: u64,
        timestamp: u64,
    },
    /// An explicit restart completed.
    Restarted { process_id: String, timestamp: u64 },
    /// A replica reached `stopped`.
    Stopped {
        process_id: String,
        replica_id: String,
        timestamp: u64,
    },
    /// A replica gave up (spawn failure or restart budget exhausted).
    Errored {
        process_id: String,
        replica_id: String,
        timestamp: u64,
    },
    /// A process was removed.
    Deleted { process_id: String, timestamp: u64 },
    /// A reload pass finished.
    Reloaded { count: usize, timestamp: u64 },
    /// The daemon began its shutdown sequence.
    ShuttingDown { timestamp: u64 },
    /// A line of supervisor-level output attributed to a process.
    Log {
        process_id: String,
        line: String,
        timestamp: u64,
    },
}

impl DaemonEvent {
    /// The id of the process this event concerns, when there is one.
    pub fn process_id(&self) -> Option<&str> {
        match self {
            DaemonEvent::Started { process_id, .. }
            | DaemonEvent::Exited { process_id, .. }
            | DaemonEvent::Crashed { process_id, .. }
            | DaemonEvent::RestartScheduled { process_id, .. }
            | DaemonEvent::Restarted { process_id, .. }
            | DaemonEvent::Stopped { process_id, .. }
            | DaemonEvent::Errored { process_id, .. }
            | DaemonEvent::Deleted { process_id, .. }
            | DaemonEvent::Log { process_id, .. } => Some(process_id),
            DaemonEvent::Reloaded { .. } | DaemonEvent::ShuttingDown { .. } => None,
        }
    }
}

/// Multi-subscriber broadcast channel for [`DaemonEvent`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<DaemonEvent>>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its receiving end.
    pub fn subscribe(&self) -> Receiver<DaemonEvent> {
        let (tx, rx) = channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Publishes an event to every live subscriber, pruning closed ones.
    pub fn publish(&self, event: DaemonEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Number of live subscribers. Used by tests.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
