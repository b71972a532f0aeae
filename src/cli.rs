//! Command-line interface for nodedaemon.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for nodedaemon.
#[derive(Parser)]
#[command(name = "noded", version, author)]
#[command(about = "A process supervisor daemon", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for noded.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor daemon in the foreground.
    Daemon,

    /// Declare and start a new managed process.
    Start {
        /// Path to the executable or interpreted program.
        script: PathBuf,

        /// Human label for the process (defaults to the script stem).
        #[arg(long)]
        name: Option<String>,

        /// Replica count: a positive integer or 'max' for one per CPU.
        #[arg(long, default_value = "1")]
        instances: String,

        /// Interpreter for the script (defaults to node).
        #[arg(long)]
        interpreter: Option<String>,

        /// Working directory for the children.
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment entries, KEY=VALUE. Repeatable.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Watch the script's directory and restart on changes.
        #[arg(long)]
        watch: bool,

        /// Watch an explicit path instead. Repeatable.
        #[arg(long = "watch-path", value_name = "PATH")]
        watch_paths: Vec<PathBuf>,

        /// Upper bound on automatic restarts per replica.
        #[arg(long)]
        max_restarts: Option<u32>,

        /// Base backoff delay in milliseconds.
        #[arg(long)]
        restart_delay: Option<i64>,

        /// Backoff ceiling in milliseconds.
        #[arg(long)]
        max_restart_delay: Option<i64>,

        /// Uptime (ms) after which the restart counter resets.
        #[arg(long)]
        min_uptime: Option<u64>,

        /// Arguments passed to the script.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Stop a process by id or name.
    Stop {
        /// Process id or name.
        target: String,

        /// Skip the graceful phase and SIGKILL immediately.
        #[arg(long)]
        force: bool,
    },

    /// Stop and relaunch a process by id or name.
    Restart {
        /// Process id or name.
        target: String,
    },

    /// Remove a stopped process by id or name.
    Delete {
        /// Process id or name.
        target: String,
    },

    /// List every managed process.
    List,

    /// Show detailed status for the daemon or one process.
    Status {
        /// Process id or name. Omit for a daemon-wide summary.
        target: Option<String>,
    },

    /// Print the tail of a process's log.
    Logs {
        /// Process id or name.
        target: String,

        /// Number of lines to print.
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },

    /// Check that the daemon is alive.
    Ping,

    /// Ask the daemon to stop everything and exit.
    Shutdown,
}

/// Parses CLI arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
