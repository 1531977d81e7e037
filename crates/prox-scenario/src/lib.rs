//! # Prox Scenario
//!
//! Composes the proxy process, readiness probe, workload and an optional AMQP
//! liveness check into one scenario with guaranteed teardown, configured from
//! YAML.

pub mod config;
pub mod liveness;
pub mod runner;

pub use config::{LivenessConfig, LoadTestConfig, ProxyConfig, ReadinessSettings, ScenarioConfig, ScenarioOptions};
pub use liveness::{AmqpLivenessCheck, LivenessCheck};
pub use runner::{
    proxy_arguments, resolve_proxy_executable, ProcessScenarioRunner, ScenarioPlan, ScenarioReport, ScenarioRunner,
    PROXY_BINARY, PROXY_BIN_DIR_ENV,
};
