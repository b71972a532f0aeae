//! Restart backoff policy and the cancellable timer table.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use tracing::debug;

/// Computes the delay before the next automatic restart attempt.
///
/// The schedule is `min(max_ms, base_ms · 2^restarts)`, saturating at
/// `max_ms` whenever the doubling overflows. The result is monotonic in
/// `restarts` until it saturates and always lies in `[0, max_ms]`.
pub fn backoff_delay(restarts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let factor = match 1u64.checked_shl(restarts) {
        Some(factor) => factor,
        None => return max_ms,
    };
    match base_ms.checked_mul(factor) {
        Some(delay) => delay.min(max_ms),
        None => max_ms,
    }
}

struct TimerState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Pending restart timers keyed by replica id.
///
/// Each timer fires at most once. Cancellation is synchronous: after
/// `cancel` returns, the timer's callback will not begin. A callback that
/// has already begun must re-validate the replica state it acts on.
#[derive(Clone, Default)]
pub struct RestartTimers {
    table: Arc<Mutex<HashMap<String, Arc<TimerState>>>>,
}

impl RestartTimers {
    /// Creates an empty timer table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer for `replica_id`, replacing any pending one.
    pub fn schedule<F>(&self, replica_id: &str, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel(replica_id);

        let state = Arc::new(TimerState {
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        });

        {
            let Ok(mut table) = self.table.lock() else {
                return;
            };
            table.insert(replica_id.to_string(), Arc::clone(&state));
        }

        let table = Arc::clone(&self.table);
        let key = replica_id.to_string();
        thread::spawn(move || {
            let fire = {
                let Ok(guard) = state.cancelled.lock() else {
                    return;
                };
                let (guard, _timeout) = match state
                    .wake
                    .wait_timeout_while(guard, delay, |cancelled| !*cancelled)
                {
                    Ok(res) => res,
                    Err(_) => return,
                };
                !*guard
            };

            if let Ok(mut table) = table.lock() {
                // Only deregister our own entry; a replacement may have
                // been armed in the meantime.
                if table
                    .get(&key)
                    .map(|entry| Arc::ptr_eq(entry, &state))
                    .unwrap_or(false)
                {
                    table.remove(&key);
                }
            }

            if fire {
                callback();
            } else {
                debug!("restart timer for replica {key} cancelled before firing");
            }
        });
    }

    /// Cancels the pending timer for `replica_id`, if any.
    pub fn cancel(&self, replica_id: &str) {
        let entry = {
            let Ok(mut table) = self.table.lock() else {
                return;
            };
            table.remove(replica_id)
        };
        if let Some(state) = entry {
            if let Ok(mut cancelled) = state.cancelled.lock() {
                *cancelled = true;
            }
            state.wake.notify_all();
        }
    }

    /// Cancels every pending timer. Used by shutdown.
    pub fn cancel_all(&self) {
        let entries: Vec<Arc<TimerState>> = {
            let Ok(mut table) = self.table.lock() else {
                return;
            };
            table.drain().map(|(_, state)| state).collect()
        };
        for state in entries {
            if let Ok(mut cancelled) = state.cancelled.lock() {
                *cancelled = true;
            }
            state.wake.notify_all();
        }
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }
}
