//! Per-pid CPU and memory sampling for health checks.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// A point-in-time resource sample for one OS process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// CPU usage percentage (0.0–100.0 per core).
    pub cpu_percent: f32,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
}

/// Samples live processes through the system process table.
pub struct ProcessSampler {
    system: Mutex<System>,
}

impl ProcessSampler {
    /// Creates a sampler with an empty process table.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Returns the current CPU/RSS of `pid`, or `None` if it is gone.
    pub fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let Ok(mut system) = self.system.lock() else {
            return None;
        };
        let target = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system.process(target).map(|process| ResourceSample {
            cpu_percent: process.cpu_usage(),
            rss_bytes: process.memory(),
        })
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}
