//! Scenarios driven from YAML, the way the harness binary runs them.

use e2e_tests::{banner, free_port, get_testpeer_path};
use prox_common::RecordingSink;
use prox_connection::CloseReason;
use prox_process::StopOutcome;
use prox_scenario::{ProcessScenarioRunner, ScenarioConfig, PROXY_BIN_DIR_ENV};
use std::path::{Path, PathBuf};

/// Shell wrapper that turns testpeer into a drop-in proxy binary.
#[cfg(unix)]
fn write_proxy_wrapper(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let wrapper = dir.join("fake-amqpprox");
    let script = format!("#!/bin/sh\nexec \"{}\" proxy \"$@\"\n", get_testpeer_path().display());
    std::fs::write(&wrapper, script).expect("Failed to write proxy wrapper");
    std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to make proxy wrapper executable");
    wrapper
}

#[cfg(unix)]
#[test]
fn test_scenario_from_yaml_file() {
    banner("TEST: Scenario From YAML File");

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let wrapper = write_proxy_wrapper(dir.path());
    let testpeer = get_testpeer_path();
    let listen_port = free_port();
    let destination_port = free_port();

    let yaml = format!(
        r#"
scenario:
  name: yaml-hundred-clients
proxy:
  executable: {wrapper}
  listen_host: 127.0.0.1
  listen_port: {listen_port}
  destination_port: {destination_port}
  log_file: {proxy_log}
readiness:
  poll_interval: 100ms
  max_wait: 10s
load_test:
  program: {testpeer}
  leading_args: ["workload", "--connect"]
  message_size: 100
  num_messages: 1
  max_threads: 10
  clients: 100
  timeout: 60s
  log_file: {workload_log}
liveness:
  heartbeat: 4
"#,
        wrapper = wrapper.display(),
        listen_port = listen_port,
        destination_port = destination_port,
        proxy_log = dir.path().join("proxy.log").display(),
        testpeer = testpeer.display(),
        workload_log = dir.path().join("workload.log").display(),
    );
    let config_path = dir.path().join("scenario.yaml");
    std::fs::write(&config_path, yaml).expect("Failed to write scenario file");

    println!("Step 1: Loading scenario file...");
    let config = ScenarioConfig::load_from_file(&config_path).expect("scenario file should load");
    assert_eq!(config.scenario.name, "yaml-hundred-clients");
    assert_eq!(config.load_test_parameters().client_count, 100);
    println!("✓ Scenario loaded\n");

    println!("Step 2: Running scenario...");
    let sink = RecordingSink::new();
    let mut runner = ProcessScenarioRunner::from_config(&config, sink.clone());
    let report = match runner.run() {
        Ok(report) => report,
        Err(e) => {
            let proxy_log = std::fs::read_to_string(dir.path().join("proxy.log")).unwrap_or_default();
            let workload_log = std::fs::read_to_string(dir.path().join("workload.log")).unwrap_or_default();
            panic!("Test failed: {}\nproxy:\n{}\nworkload:\n{}", e, proxy_log, workload_log);
        }
    };

    assert!(report.workload_exit.success());
    assert!(matches!(report.proxy_stop, StopOutcome::Terminated(_)), "proxy stop: {:?}", report.proxy_stop);
    assert_eq!(report.liveness, Some(CloseReason::LocalClosed { acknowledged: true }));
    assert_eq!(sink.count("scenario_passed"), 1);
    assert_eq!(sink.count("proxy_stopped"), 1);
    println!("✓ Scenario passed with liveness check\n");

    banner("✓ TEST PASSED: Scenario From YAML File");
}

/// The real proxy and performance tester.
///
/// Needs `AMQPPROX_BIN_DIR` pointing at the proxy build, `PERF_TESTER_MANIFEST`
/// pointing at the performance tester's Cargo.toml, and ports 5671/5672 free.
#[test]
#[ignore] // Run manually with --ignored
fn test_real_proxy_hundred_clients() {
    banner("TEST: Real Proxy, Hundred Clients");

    let bin_dir = std::env::var(PROXY_BIN_DIR_ENV).expect("AMQPPROX_BIN_DIR must be set");
    let manifest = std::env::var("PERF_TESTER_MANIFEST").expect("PERF_TESTER_MANIFEST must be set");
    println!("Proxy binaries: {}", bin_dir);
    println!("Performance tester: {}", manifest);

    let yaml = format!(
        r#"
scenario:
  name: amqpprox-hundred-clients
proxy:
  listen_port: 5672
  destination_port: 5671
readiness:
  poll_interval: 500ms
  max_wait: 10s
load_test:
  perf_tester_manifest: {manifest}
  message_size: 100
  num_messages: 1
  max_threads: 10
  clients: 100
"#,
        manifest = manifest,
    );
    let config = ScenarioConfig::load_from_string(&yaml).expect("scenario should load");

    let sink = RecordingSink::new();
    let mut runner = ProcessScenarioRunner::from_config(&config, sink.clone());
    match runner.run() {
        Ok(report) => {
            println!("Ready after {:?}, workload {}", report.ready_after, report.workload_exit);
            banner("✓ TEST PASSED: Real Proxy, Hundred Clients");
        }
        Err(e) => {
            banner("✗ TEST FAILED: Real Proxy, Hundred Clients");
            panic!("Test failed: {}", e);
        }
    }
}
