//! Single intake point for OS signals.
//!
//! The daemon masks its control signals and drains them from one dedicated
//! thread, posting typed messages to the main loop instead of sprinkling
//! handlers across modules. Children unblock the mask again before exec.

use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

use nix::{errno::Errno, sys::signal::SigSet, sys::signal::Signal};
use tracing::{debug, warn};

/// Control messages derived from OS signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// SIGTERM or SIGINT: begin graceful shutdown.
    Shutdown,
    /// SIGHUP: restart every running process.
    Reload,
}

/// The set of signals routed through the intake.
pub fn control_sigset() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGHUP);
    set
}

/// Masks the control signals for this thread (and every thread spawned
/// after it) and starts the intake thread.
///
/// Must run before any worker thread is spawned so the mask is inherited
/// everywhere and `SigSet::wait` is the only consumer.
pub fn spawn_intake() -> Result<Receiver<DaemonSignal>, Errno> {
    let set = control_sigset();
    set.thread_block()?;

    let (tx, rx) = channel();
    thread::spawn(move || intake_loop(set, tx));
    Ok(rx)
}

fn intake_loop(set: SigSet, tx: Sender<DaemonSignal>) {
    loop {
        match set.wait() {
            Ok(signal) => {
                let message = match signal {
                    Signal::SIGTERM | Signal::SIGINT => DaemonSignal::Shutdown,
                    Signal::SIGHUP => DaemonSignal::Reload,
                    other => {
                        debug!("ignoring unexpected signal {other}");
                        continue;
                    }
                };
                debug!("received {signal}, posting {message:?}");
                if tx.send(message).is_err() {
                    return;
                }
                if message == DaemonSignal::Shutdown {
                    return;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!("signal wait failed: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sending real process-wide signals from a unit test would race the
    // harness's own threads, so delivery is exercised end-to-end in the
    // integration suite against the daemon binary.
    #[test]
    fn control_set_covers_the_routed_signals() {
        let set = control_sigset();
        for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
            assert!(set.contains(signal));
        }
        assert!(!set.contains(Signal::SIGUSR1));
    }
}
