//! Helpers shared by the test suites.

use std::{
    env,
    ffi::OsString,
    fs,
    path::Path,
    sync::{Mutex, MutexGuard, OnceLock},
};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serializes tests that mutate process-wide environment variables.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

/// Points `HOME` at a scratch directory for the guard's lifetime, holding
/// the environment lock so concurrent tests cannot interleave.
pub struct HomeGuard {
    original: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl HomeGuard {
    /// Creates `path` and redirects `HOME` to it.
    pub fn set(path: &Path) -> Self {
        let lock = env_lock();
        fs::create_dir_all(path).expect("failed to create scratch home");
        let original = env::var_os("HOME");
        unsafe {
            env::set_var("HOME", path);
        }
        Self {
            original,
            _lock: lock,
        }
    }
}

impl Drop for HomeGuard {
    fn drop(&mut self) {
        match self.original.take() {
            Some(value) => unsafe { env::set_var("HOME", value) },
            None => unsafe { env::remove_var("HOME") },
        }
    }
}
