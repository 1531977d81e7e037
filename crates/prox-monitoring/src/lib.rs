//! # Prox Monitoring
//!
//! Reachability checks for the processes a scenario depends on.
//!
//! The only check a proxy scenario needs is "does the listen port accept TCP
//! connections yet", provided by [`ReadinessProbe`].

pub mod readiness;

pub use readiness::{wait_until_ready, ProbeReport, ReadinessCheck, ReadinessConfig, ReadinessProbe};
