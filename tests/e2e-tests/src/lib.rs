// E2E test framework for the AMQP proxy harness

pub mod scenario;

pub use scenario::{CountingProxy, PeerOptions, ScenarioExecutor};

use std::env;
use std::net::TcpListener;
use std::path::PathBuf;

/// Directory holding the test binaries, e.g. `target/debug`.
fn profile_dir() -> PathBuf {
    let mut path = env::current_exe()
        .expect("Failed to get current exe path")
        .parent()
        .expect("Failed to get parent dir")
        .to_path_buf();

    // If we're in deps/, go up one level
    if path.ends_with("deps") {
        path.pop();
    }
    path
}

/// Get the path to the TESTPEER (testpeer) binary
pub fn get_testpeer_path() -> PathBuf {
    let mut path = profile_dir();

    #[cfg(windows)]
    path.push("testpeer.exe");

    #[cfg(not(windows))]
    path.push("testpeer");

    if !path.exists() {
        panic!("TESTPEER binary not found at: {}", path.display());
    }

    path
}

/// A TCP port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind ephemeral port");
    listener.local_addr().expect("Failed to read local address").port()
}

/// Create a temporary test directory
pub fn create_test_dir(test_name: &str) -> PathBuf {
    // Use target/tmp instead of system temp to keep artifacts next to the build
    let target_dir = profile_dir()
        .parent()
        .expect("Failed to get target dir")
        .to_path_buf();

    let temp_dir = target_dir.join("tmp").join(format!("e2e-test-{}", test_name));

    if temp_dir.exists() {
        std::fs::remove_dir_all(&temp_dir).ok();
    }
    std::fs::create_dir_all(&temp_dir).expect("Failed to create test directory");
    temp_dir
}

/// Clean up test directory
pub fn cleanup_test_dir(dir: &PathBuf) {
    if dir.exists() {
        std::fs::remove_dir_all(dir).ok();
    }
}

/// Print a test banner
pub fn banner(title: &str) {
    println!("\n========================================");
    println!("{}", title);
    println!("========================================\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_sits_beside_build_profile() {
        let dir = create_test_dir("layout");
        let tmp = dir.parent().unwrap();
        assert!(tmp.ends_with("tmp"));
        assert_eq!(tmp.parent().unwrap(), profile_dir().parent().unwrap());
        let names: Vec<_> = dir.components().map(|c| c.as_os_str().to_owned()).collect();
        assert!(!names.windows(2).any(|pair| pair[0] == "target" && pair[1] == "target"));
        cleanup_test_dir(&dir);
        assert!(!dir.exists());
    }
}
