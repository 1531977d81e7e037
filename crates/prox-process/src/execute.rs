//! Process execution primitives.

use crate::validation::validate_executable;
use prox_common::{HarnessError, HarnessResult, ProcessSpec};
use std::fs::File;
use std::io::ErrorKind;
use std::process::{Child, Command, Stdio};
use tracing::debug;

/// Build the [`Command`] described by `spec`.
///
/// Output goes to `spec.log_file` when set (stdout and stderr share the file),
/// otherwise it is inherited from the harness.
pub fn build_command(spec: &ProcessSpec) -> HarnessResult<Command> {
    let mut cmd = Command::new(&spec.executable_path);
    cmd.args(&spec.arguments)
        .envs(&spec.environment)
        .stdin(Stdio::null());

    if let Some(dir) = &spec.working_directory {
        cmd.current_dir(dir);
    }

    if let Some(log_path) = &spec.log_file {
        let log_file = File::create(log_path).map_err(|e| {
            HarnessError::spawn(
                &spec.executable_path,
                format!("Failed to create log file {}: {}", log_path.display(), e),
            )
        })?;
        let log_file_clone = log_file.try_clone().map_err(|e| {
            HarnessError::spawn(&spec.executable_path, format!("Failed to clone log file: {}", e))
        })?;
        cmd.stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_clone));
    }

    Ok(cmd)
}

/// Spawn the process described by `spec`.
pub fn spawn(spec: &ProcessSpec) -> HarnessResult<Child> {
    validate_executable(&spec.executable_path)?;

    let mut cmd = build_command(spec)?;
    debug!("Spawning: {}", spec.command_line());

    cmd.spawn().map_err(|e| {
        let reason = match e.kind() {
            ErrorKind::NotFound => format!("executable not found: {}", e),
            ErrorKind::PermissionDenied => format!("permission denied: {}", e),
            _ => e.to_string(),
        };
        HarnessError::spawn(&spec.executable_path, reason)
    })
}
