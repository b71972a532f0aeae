//! Process declarations and their validation.
//!
//! A [`ProcessConfig`] is the immutable policy attached to a managed
//! process. Declarations arrive as JSON over the control plane (or from a
//! JSON app file on the CLI side) and are validated once, before the
//! orchestrator ever sees them. Unknown keys are rejected rather than
//! silently accepted.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    thread,
};

use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        DEFAULT_INTERPRETER, DEFAULT_MAX_RESTART_DELAY_MS, DEFAULT_MAX_RESTARTS,
        DEFAULT_MIN_UPTIME_MS, DEFAULT_RESTART_DELAY_MS, SAFE_ENV_VARS,
    },
    error::DaemonError,
};

/// Replica count declaration: a positive integer or the literal `"max"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instances {
    /// Fixed replica count.
    Count(u32),
    /// String form; only `"max"` (host logical-CPU count) is accepted.
    Literal(String),
}

impl Default for Instances {
    fn default() -> Self {
        Instances::Count(1)
    }
}

impl Instances {
    /// Resolves the declaration to a concrete replica count.
    pub fn resolve(&self) -> Result<usize, DaemonError> {
        match self {
            Instances::Count(0) => Err(DaemonError::Validation(
                "instances must be a positive integer or 'max'".into(),
            )),
            Instances::Count(n) => Ok(*n as usize),
            Instances::Literal(word) if word == "max" => Ok(host_cpu_count()),
            Instances::Literal(word) => Err(DaemonError::Validation(format!(
                "invalid instances value '{word}' (expected a positive integer or 'max')"
            ))),
        }
    }
}

/// Number of logical CPUs on this host.
pub fn host_cpu_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Replica layout strategy derived from the instance count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One replica.
    Single,
    /// Several replicas of the same script supervised as a worker group.
    Cluster,
}

/// Filesystem watch declaration: a flag or an explicit path list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatchConfig {
    /// `true` watches the script's directory; `false` disables watching.
    Enabled(bool),
    /// Watch exactly these paths.
    Paths(Vec<PathBuf>),
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig::Enabled(false)
    }
}

impl WatchConfig {
    /// Whether any watching is requested.
    pub fn is_active(&self) -> bool {
        match self {
            WatchConfig::Enabled(flag) => *flag,
            WatchConfig::Paths(paths) => !paths.is_empty(),
        }
    }

    /// The concrete paths to observe for a given script.
    pub fn watch_paths(&self, script: &Path) -> Vec<PathBuf> {
        match self {
            WatchConfig::Enabled(false) => Vec::new(),
            WatchConfig::Enabled(true) => script
                .parent()
                .map(|dir| vec![dir.to_path_buf()])
                .unwrap_or_default(),
            WatchConfig::Paths(paths) => paths.clone(),
        }
    }
}

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

fn default_restart_delay() -> i64 {
    DEFAULT_RESTART_DELAY_MS
}

fn default_max_restart_delay() -> i64 {
    DEFAULT_MAX_RESTART_DELAY_MS
}

fn default_min_uptime() -> u64 {
    DEFAULT_MIN_UPTIME_MS
}

/// The immutable declaration for a managed process.
///
/// Delay fields are carried as signed integers so that negative inputs can
/// be rejected with a validation error instead of a type error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProcessConfig {
    /// Absolute path to the target executable or interpreted program.
    pub script: String,
    /// Human label; defaults to the script's file stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Replica count, or `"max"` for the host CPU count.
    #[serde(default)]
    pub instances: Instances,
    /// Interpreter for the `spawn` launch method (default `node`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    /// Arguments passed after the script.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Working directory for the children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Explicit child environment; layered over the safe host allowlist.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Filesystem watch declaration driving automatic restarts.
    #[serde(default)]
    pub watch: WatchConfig,
    /// Upper bound on automatic restarts per replica slot.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Base delay for exponential restart backoff, in milliseconds.
    #[serde(default = "default_restart_delay")]
    pub restart_delay: i64,
    /// Ceiling for restart backoff, in milliseconds.
    #[serde(default = "default_max_restart_delay")]
    pub max_restart_delay: i64,
    /// Uptime after which a replica's restart counter resets, in milliseconds.
    #[serde(default = "default_min_uptime")]
    pub min_uptime: u64,
}

impl ProcessConfig {
    /// Creates a minimal declaration for the given script.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            name: None,
            instances: Instances::default(),
            interpreter: None,
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            watch: WatchConfig::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay: DEFAULT_RESTART_DELAY_MS,
            max_restart_delay: DEFAULT_MAX_RESTART_DELAY_MS,
            min_uptime: DEFAULT_MIN_UPTIME_MS,
        }
    }

    /// Checks the declaration against the data-model rules.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.script.trim().is_empty() {
            return Err(DaemonError::Validation("script must not be empty".into()));
        }
        if !Path::new(&self.script).is_absolute() {
            return Err(DaemonError::Validation(format!(
                "script must be an absolute path, got '{}'",
                self.script
            )));
        }
        if let Some(name) = &self.name
            && name.trim().is_empty()
        {
            return Err(DaemonError::Validation("name must not be empty".into()));
        }
        if let Some(interpreter) = &self.interpreter
            && interpreter.trim().is_empty()
        {
            return Err(DaemonError::Validation(
                "interpreter must not be empty".into(),
            ));
        }
        self.instances.resolve()?;
        if self.restart_delay < 0 {
            return Err(DaemonError::Validation(format!(
                "restartDelay must be non-negative, got {}",
                self.restart_delay
            )));
        }
        if self.max_restart_delay < 0 {
            return Err(DaemonError::Validation(format!(
                "maxRestartDelay must be non-negative, got {}",
                self.max_restart_delay
            )));
        }
        if let WatchConfig::Paths(paths) = &self.watch {
            for path in paths {
                if !path.is_absolute() {
                    return Err(DaemonError::Validation(format!(
                        "watch paths must be absolute, got '{}'",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// The effective process name.
    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        Path::new(&self.script)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.script.clone())
    }

    /// The interpreter used by the `spawn` launch method.
    pub fn resolved_interpreter(&self) -> &str {
        self.interpreter.as_deref().unwrap_or(DEFAULT_INTERPRETER)
    }

    /// Single vs. cluster, derived from the resolved instance count.
    pub fn strategy(&self) -> Strategy {
        match self.instances.resolve() {
            Ok(n) if n > 1 => Strategy::Cluster,
            _ => Strategy::Single,
        }
    }

    /// Backoff base delay. Only meaningful after validation.
    pub fn restart_delay_ms(&self) -> u64 {
        self.restart_delay.max(0) as u64
    }

    /// Backoff ceiling. Only meaningful after validation.
    pub fn max_restart_delay_ms(&self) -> u64 {
        self.max_restart_delay.max(0) as u64
    }
}

/// Builds the environment presented to a child process: the safe allowlist
/// of host variables with the declaration's explicit `env` layered on top.
pub fn child_environment(config_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for key in SAFE_ENV_VARS {
        if let Ok(value) = env::var(key) {
            merged.insert((*key).to_string(), value);
        }
    }
    for (key, value) in config_env {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
