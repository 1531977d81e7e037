//! Process termination primitives.

use prox_common::{HarnessError, HarnessResult};
use std::process::Child;

/// Ask a process to exit (SIGTERM on Unix).
///
/// On other platforms there is no graceful signal to send, so this is a
/// no-op and callers fall through to [`force_kill`] after their grace period.
pub fn terminate_gracefully(pid: u32) -> HarnessResult<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| HarnessError::invalid_state(pid.to_string(), "signalable process", e.to_string()))
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(())
    }
}

/// Force kill a process (SIGKILL on Unix, TerminateProcess on Windows).
///
/// Killing a child that already exited is not an error.
pub fn force_kill(child: &mut Child) -> HarnessResult<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(HarnessError::invalid_state(
            child.id().to_string(),
            "killable process",
            e.to_string(),
        )),
    }
}
