//! Process supervisor daemon for single-host services.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Wall-clock timestamps and id generation.
pub mod clock;

/// Process declarations and validation.
pub mod config;

/// Constants and tunables.
pub mod constants;

/// Errors.
pub mod error;

/// Lifecycle event broadcast.
pub mod events;

/// Framed stream codec.
pub mod frame;

/// Control plane over the local socket.
pub mod ipc;

/// Per-process log files and rotation.
pub mod logs;

/// Per-pid resource sampling.
pub mod metrics;

/// Lifecycle orchestration.
pub mod orchestrator;

/// Managed process data model.
pub mod process;

/// Request rate limiting.
pub mod ratelimit;

/// Restart backoff and timers.
pub mod restart;

/// Runtime paths.
pub mod runtime;

/// OS signal intake.
pub mod signals;

/// Durable state persistence.
pub mod state;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;

/// Debounced file watching.
pub mod watcher;
