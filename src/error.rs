//! Error handling for nodedaemon.
use thiserror::Error;

/// Top-level error taxonomy for supervisor operations.
///
/// Errors caused by user input (`Validation`, `NotFound`, `Conflict`) are
/// returned to the caller verbatim. Errors raised during automatic actions
/// (restart, reload, shutdown) are logged and swallowed at the per-process
/// boundary so one bad actor cannot block the group.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The supplied configuration is malformed or incomplete.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// No process matches the given id or name.
    #[error("no process matches '{0}'")]
    NotFound(String),

    /// The operation conflicts with the current lifecycle state.
    #[error("{0}")]
    Conflict(String),

    /// A replica did not reach `running` within the start timeout.
    #[error("replica for '{process}' did not come up within {timeout_ms} ms")]
    StartTimeout {
        /// Name of the process that failed to come up.
        process: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The operating system refused to spawn the child.
    #[error("failed to spawn '{script}': {source}")]
    SpawnFailure {
        /// The script that could not be launched.
        script: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Error from the state store.
    #[error(transparent)]
    State(#[from] StateStoreError),

    /// Error from the file watcher.
    #[error(transparent)]
    Watch(#[from] WatcherError),

    /// I/O error outside any more specific category.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error raised while signalling a child process.
    #[error("failed to signal process: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// A §3-style data-model invariant failed inside the daemon.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    /// A lock guarding shared state was poisoned.
    #[error("mutex is poisoned: {0}")]
    MutexPoison(String),
}

impl<T> From<std::sync::PoisonError<T>> for DaemonError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DaemonError::MutexPoison(err.to_string())
    }
}

/// Error type for state-store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Error reading or writing the state file.
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error encoding or decoding the state document.
    #[error("state document is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    /// A backup path was requested that does not exist.
    #[error("backup file not found: {0}")]
    BackupNotFound(String),
}

/// Error type for file-watcher operations.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// Error from the OS notification backend.
    #[error("filesystem watch failed: {0}")]
    Notify(#[from] notify::Error),

    /// Error stating or reading a watched file.
    #[error("failed to inspect watched path: {0}")]
    Io(#[from] std::io::Error),

    /// An ignore glob could not be translated to a regular expression.
    #[error("invalid ignore pattern '{0}'")]
    Pattern(String),
}
