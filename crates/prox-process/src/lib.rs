//! # Prox Process
//!
//! Owns the lifetime of the external processes a scenario depends on:
//! - Spawning from a [`ProcessSpec`](prox_common::ProcessSpec)
//! - Signal based termination with a bounded grace period
//! - Process existence checks
//! - Guarded teardown ([`ProcessGuard`]) that runs on every exit path
//! - One-shot load test invocations ([`LoadTestInvocation`])

pub mod check;
pub mod execute;
pub mod managed;
pub mod terminate;
pub mod validation;

// Re-export main types
pub use check::process_exists;
pub use execute::spawn;
pub use load_test::{workload_arguments, LoadTestInvocation, Workload, WorkloadCommand};
pub use managed::{
    ManagedProcess, ManagedProcessState, ProcessGuard, ProcessHandle, ProxyProcess, StopOutcome,
};
pub use terminate::{force_kill, terminate_gracefully};
pub use validation::validate_executable;
