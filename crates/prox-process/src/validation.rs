//! Validation of process specifications before launch.

use prox_common::{HarnessError, HarnessResult};
use std::path::{Path, PathBuf};

/// Validate that an executable exists and is launchable.
///
/// Paths containing a separator are checked directly; bare names are looked
/// up on `PATH` the same way the OS would when spawning.
pub fn validate_executable(executable: &str) -> HarnessResult<PathBuf> {
    if executable.trim().is_empty() {
        return Err(HarnessError::spawn(executable, "Executable path cannot be empty"));
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return check_candidate(path)
            .map(|()| path.to_path_buf())
            .map_err(|reason| HarnessError::spawn(executable, reason));
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search_path) {
        let candidate = dir.join(executable);
        if check_candidate(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    Err(HarnessError::spawn(executable, "executable not found on PATH"))
}

fn check_candidate(path: &Path) -> Result<(), String> {
    let metadata = std::fs::metadata(path).map_err(|e| format!("{} ({})", e, path.display()))?;
    if !metadata.is_file() {
        return Err(format!("not a regular file: {}", path.display()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(format!("permission denied: {} is not executable", path.display()));
        }
    }

    Ok(())
}
