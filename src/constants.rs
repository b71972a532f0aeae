//! Constants and tunables for the nodedaemon supervisor.
//!
//! This module centralizes timeouts, file names, and size limits used
//! throughout the daemon so the policy surface is visible in one place.

use std::{env, time::Duration};

// ============================================================================
// File System Constants
// ============================================================================

/// Name of the persisted daemon state file stored in the runtime directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Schema version written into every persisted state document.
pub const STATE_SCHEMA_VERSION: &str = "1";

/// Name of the control socket inside the runtime directory.
pub const SOCKET_FILE_NAME: &str = "daemon.sock";

// ============================================================================
// Process Management Timing
// ============================================================================

/// Maximum time to wait for a replica to reach `running` during start.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL during a non-forced stop.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Additional wait after SIGKILL before a replica is cleaned up regardless.
pub const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Cleanup wait after an immediate (forced) SIGKILL.
pub const FORCE_STOP_CLEANUP: Duration = Duration::from_secs(1);

/// Poll interval used when supervising an adopted (re-attached) replica.
pub const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Environment override for the graceful-stop grace period, in milliseconds.
/// Only intended for the integration test suite.
pub const GRACE_TIMEOUT_ENV: &str = "NODEDAEMON_GRACE_TIMEOUT_MS";

/// Environment override for the post-SIGKILL cleanup window, in milliseconds.
pub const FORCE_TIMEOUT_ENV: &str = "NODEDAEMON_FORCE_TIMEOUT_MS";

/// Returns the effective SIGTERM grace period, honoring the test override.
pub fn graceful_shutdown_timeout() -> Duration {
    duration_from_env(GRACE_TIMEOUT_ENV, GRACEFUL_SHUTDOWN_TIMEOUT)
}

/// Returns the effective post-SIGKILL cleanup window, honoring the test override.
pub fn force_kill_timeout() -> Duration {
    duration_from_env(FORCE_TIMEOUT_ENV, FORCE_KILL_TIMEOUT)
}

fn duration_from_env(var: &str, default: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// ============================================================================
// Restart Policy Defaults
// ============================================================================

/// Default upper bound on automatic restarts per replica slot.
pub const DEFAULT_MAX_RESTARTS: u32 = 16;

/// Default base delay for exponential restart backoff, in milliseconds.
pub const DEFAULT_RESTART_DELAY_MS: i64 = 100;

/// Default ceiling for restart backoff, in milliseconds.
pub const DEFAULT_MAX_RESTART_DELAY_MS: i64 = 15_000;

/// Default uptime after which a replica's restart counter is reset, in
/// milliseconds.
pub const DEFAULT_MIN_UPTIME_MS: u64 = 1_000;

/// Default interpreter used for the `spawn` launch method.
pub const DEFAULT_INTERPRETER: &str = "node";

// ============================================================================
// State Store Timing
// ============================================================================

/// Quiet period after the last mutation before a debounced save fires.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Interval for unconditional periodic saves of dirty state.
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Worker wake-up granularity for the state store thread.
pub const STORE_TICK: Duration = Duration::from_millis(250);

// ============================================================================
// File Watcher
// ============================================================================

/// Per-file debounce applied to raw filesystem notifications.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// Glob patterns ignored by the file watcher unless overridden.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "node_modules/**",
    ".git/**",
    "*.log",
    "*.tmp",
    ".DS_Store",
    "Thumbs.db",
];

// ============================================================================
// Framed Stream Codec
// ============================================================================

/// Default maximum accepted frame payload (10 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024;

// ============================================================================
// Logging and Rotation
// ============================================================================

/// A process log is rotated once it exceeds this size (10 MiB).
pub const LOG_ROTATE_SIZE: u64 = 10 * 1024 * 1024;

/// Number of compressed log generations retained per process.
pub const LOG_MAX_GENERATIONS: u32 = 5;

/// Default number of lines returned by the `logs` control operation.
pub const DEFAULT_LOG_TAIL_LINES: usize = 50;

// ============================================================================
// Rate Limiting
// ============================================================================

/// Sliding window length shared by all rate-limiter policies.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Requests per window for the HTTP surface.
pub const RATE_LIMIT_HTTP: usize = 100;

/// Messages per window for framed stream connections.
pub const RATE_LIMIT_FRAMED: usize = 200;

/// Requests per window for the local control socket.
pub const RATE_LIMIT_IPC: usize = 1000;

// ============================================================================
// Child Environment
// ============================================================================

/// Host environment variables forwarded to children. Everything else is
/// withheld; config-level `env` entries are layered on top and win.
pub const SAFE_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "LC_ALL", "LC_CTYPE",
    "TZ", "TMPDIR", "TEMP", "TMP", "NODE_ENV", "NODE_OPTIONS",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_override_parses_millis() {
        let _guard = crate::test_utils::env_lock();
        unsafe {
            env::set_var(GRACE_TIMEOUT_ENV, "250");
        }
        assert_eq!(graceful_shutdown_timeout(), Duration::from_millis(250));
        unsafe {
            env::remove_var(GRACE_TIMEOUT_ENV);
        }
        assert_eq!(graceful_shutdown_timeout(), GRACEFUL_SHUTDOWN_TIMEOUT);
    }

    #[test]
    fn malformed_override_falls_back() {
        let _guard = crate::test_utils::env_lock();
        unsafe {
            env::set_var(FORCE_TIMEOUT_ENV, "not-a-number");
        }
        assert_eq!(force_kill_timeout(), FORCE_KILL_TIMEOUT);
        unsafe {
            env::remove_var(FORCE_TIMEOUT_ENV);
        }
    }
}
