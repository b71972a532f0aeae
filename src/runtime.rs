//! Helpers for resolving the daemon's runtime paths.
//!
//! All state lives under `$HOME/.nodedaemon`: the persisted state file, the
//! control socket, and the per-process log directory. Paths are resolved
//! from the environment on every call so tests can relocate `HOME`.

use std::{env, fs, io, path::PathBuf};

use crate::constants::{SOCKET_FILE_NAME, STATE_FILE_NAME};

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Returns the daemon's base runtime directory (`$HOME/.nodedaemon`).
pub fn base_dir() -> PathBuf {
    home_dir().join(".nodedaemon")
}

/// Returns the path of the persisted state document.
pub fn state_file_path() -> PathBuf {
    base_dir().join(STATE_FILE_NAME)
}

/// Returns the control socket path.
pub fn socket_path() -> PathBuf {
    base_dir().join(SOCKET_FILE_NAME)
}

/// Returns the directory holding per-process log files.
pub fn log_dir() -> PathBuf {
    base_dir().join("logs")
}

/// Creates the runtime directory layout if it does not exist yet.
pub fn ensure_layout() -> io::Result<()> {
    fs::create_dir_all(base_dir())?;
    fs::create_dir_all(log_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_lives_under_home() {
        let _guard = crate::test_utils::env_lock();
        let temp = tempdir().expect("tempdir");
        let original_home = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", temp.path());
        }

        ensure_layout().expect("layout");
        assert!(base_dir().ends_with(".nodedaemon"));
        assert!(base_dir().exists());
        assert!(log_dir().exists());
        assert!(state_file_path().ends_with(".nodedaemon/state.json"));
        assert!(socket_path().ends_with(".nodedaemon/daemon.sock"));

        match original_home {
            Some(val) => unsafe { env::set_var("HOME", val) },
            None => unsafe { env::remove_var("HOME") },
        }
    }
}
