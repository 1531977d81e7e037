//! Process existence checking.

use prox_common::{HarnessError, HarnessResult};

/// Check if a process with the given PID exists.
///
/// On Unix this uses `kill(pid, 0)`, which sends no signal but reports
/// whether the process exists. A zombie that has not been reaped still counts
/// as existing.
///
/// ```rust,no_run
/// use prox_process::process_exists;
///
/// if process_exists(1234).unwrap() {
///     println!("Process 1234 is running");
/// }
/// ```
pub fn process_exists(pid: u32) -> HarnessResult<bool> {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            // Exists, but owned by someone else
            Err(nix::errno::Errno::EPERM) => Ok(true),
            Err(e) => Err(HarnessError::invalid_state(
                pid.to_string(),
                "queryable process",
                format!("Failed to check process: {}", e),
            )),
        }
    }

    #[cfg(not(unix))]
    {
        Err(HarnessError::invalid_state(
            pid.to_string(),
            "queryable process",
            "process existence checks are only supported on unix",
        ))
    }
}
