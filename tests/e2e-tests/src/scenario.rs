//! Scenario wiring for E2E tests: testpeer as the proxy, testpeer as the workload.

use crate::{cleanup_test_dir, create_test_dir, free_port, get_testpeer_path};
use prox_common::{
    HarnessResult, LoadTestParameters, ProcessSpec, ProxyEndpoint, RecordingSink, SharedSink,
};
use prox_monitoring::{ReadinessConfig, ReadinessProbe};
use prox_process::{
    LoadTestInvocation, ManagedProcess, ProxyProcess, StopOutcome, WorkloadCommand,
};
use prox_scenario::{proxy_arguments, AmqpLivenessCheck, ScenarioPlan, ScenarioReport, ScenarioRunner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How the testpeer proxy behaves.
#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    pub startup_delay_ms: u64,
    pub never_listen: bool,
    pub blocked_reason: Option<String>,
    pub close_after_open: bool,
    pub heartbeat: Option<u16>,
}

impl PeerOptions {
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.startup_delay_ms > 0 {
            args.push("--startup-delay-ms".to_string());
            args.push(self.startup_delay_ms.to_string());
        }
        if self.never_listen {
            args.push("--never-listen".to_string());
        }
        if let Some(ref reason) = self.blocked_reason {
            args.push("--blocked-reason".to_string());
            args.push(reason.clone());
        }
        if self.close_after_open {
            args.push("--close-after-open".to_string());
        }
        if let Some(heartbeat) = self.heartbeat {
            args.push("--heartbeat".to_string());
            args.push(heartbeat.to_string());
        }
        args
    }
}

/// Real process control, with every start and stop counted.
pub struct CountingProxy {
    inner: ManagedProcess,
    pub starts: usize,
    pub stops: usize,
    pub outcomes: Vec<StopOutcome>,
}

impl CountingProxy {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            inner: ManagedProcess::new("testpeer-proxy", sink).with_stop_grace(Duration::from_secs(2)),
            starts: 0,
            stops: 0,
            outcomes: Vec::new(),
        }
    }
}

impl ProxyProcess for CountingProxy {
    fn start(&mut self, spec: &ProcessSpec) -> HarnessResult<u32> {
        self.starts += 1;
        ProxyProcess::start(&mut self.inner, spec)
    }

    fn stop(&mut self) -> StopOutcome {
        self.stops += 1;
        let outcome = ProxyProcess::stop(&mut self.inner);
        self.outcomes.push(outcome);
        outcome
    }
}

pub type TestScenarioRunner = ScenarioRunner<CountingProxy, ReadinessProbe, LoadTestInvocation>;

/// High-level executor for one E2E scenario
pub struct ScenarioExecutor {
    pub test_name: String,
    pub test_dir: PathBuf,
    pub testpeer_path: PathBuf,
    pub sink: Arc<RecordingSink>,
}

impl ScenarioExecutor {
    pub fn new(test_name: &str) -> Self {
        let test_dir = create_test_dir(test_name);
        let testpeer_path = get_testpeer_path();

        println!("=== Scenario Executor Setup ===");
        println!("Test: {}", test_name);
        println!("Test dir: {}", test_dir.display());
        println!("TESTPEER: {}", testpeer_path.display());
        println!("===============================\n");

        Self {
            test_name: test_name.to_string(),
            test_dir,
            testpeer_path,
            sink: RecordingSink::new(),
        }
    }

    /// Loopback endpoint on two free ports.
    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new("127.0.0.1", free_port(), "127.0.0.1", free_port())
    }

    pub fn testpeer(&self) -> String {
        self.testpeer_path.display().to_string()
    }

    /// testpeer started as the proxy, with the real proxy's flags.
    pub fn proxy_spec(&self, endpoint: &ProxyEndpoint, options: &PeerOptions) -> ProcessSpec {
        ProcessSpec::new(self.testpeer())
            .arg("proxy")
            .args(proxy_arguments(endpoint))
            .args(options.args())
            .log_file(self.test_dir.join("proxy.log"))
    }

    /// The parameters of the 100-client acceptance case.
    pub fn parameters(&self, endpoint: &ProxyEndpoint) -> LoadTestParameters {
        LoadTestParameters {
            target_url: endpoint.amqp_url(),
            listen_address: format!("127.0.0.1:{}", endpoint.destination_port),
            message_size_bytes: 100,
            num_messages: 1,
            max_threads: 10,
            client_count: 100,
        }
    }

    /// testpeer run as the workload, with `extra_args` ahead of the load test flags.
    pub fn workload(&self, extra_args: &[&str]) -> LoadTestInvocation {
        let command = WorkloadCommand::new(self.testpeer())
            .leading_args(["workload"])
            .leading_args(extra_args.iter().copied())
            .env("RUST_LOG", "info");
        LoadTestInvocation::new("testpeer-workload", command, self.sink.clone())
            .with_log_file(self.test_dir.join("workload.log"))
            .with_timeout(Duration::from_secs(60))
    }

    pub fn runner(
        &self,
        endpoint: ProxyEndpoint,
        peer: &PeerOptions,
        workload: LoadTestInvocation,
        max_wait: Duration,
    ) -> TestScenarioRunner {
        let proxy_spec = self.proxy_spec(&endpoint, peer);
        self.runner_with_spec(endpoint, proxy_spec, workload, max_wait)
    }

    /// Runner that launches `proxy_spec` instead of testpeer.
    pub fn runner_with_spec(
        &self,
        endpoint: ProxyEndpoint,
        proxy_spec: ProcessSpec,
        workload: LoadTestInvocation,
        max_wait: Duration,
    ) -> TestScenarioRunner {
        let mut plan = ScenarioPlan::new(
            &self.test_name,
            &proxy_spec.executable_path,
            endpoint.clone(),
            self.parameters(&endpoint),
        );
        plan.proxy_spec = proxy_spec;

        let readiness = ReadinessProbe::new(
            ReadinessConfig {
                poll_interval: Duration::from_millis(100),
                max_wait,
            },
            self.sink.clone(),
        );
        ScenarioRunner::new(plan, CountingProxy::new(self.sink.clone()), readiness, workload, self.sink.clone())
    }

    /// Runner that also opens one AMQP connection through the proxy after the workload.
    pub fn runner_with_liveness(
        &self,
        endpoint: ProxyEndpoint,
        peer: &PeerOptions,
        workload: LoadTestInvocation,
        max_wait: Duration,
    ) -> TestScenarioRunner {
        self.runner(endpoint, peer, workload, max_wait)
            .with_liveness(AmqpLivenessCheck::new(4, "/", self.sink.clone()))
    }

    /// Run and hand back both the result and the runner for inspection.
    pub fn run(&self, mut runner: TestScenarioRunner) -> (HarnessResult<ScenarioReport>, TestScenarioRunner) {
        let result = runner.run();
        (result, runner)
    }

    pub fn proxy_log(&self) -> String {
        std::fs::read_to_string(self.test_dir.join("proxy.log")).unwrap_or_default()
    }

    pub fn workload_log(&self) -> String {
        std::fs::read_to_string(self.test_dir.join("workload.log")).unwrap_or_default()
    }

    pub fn cleanup(&self) {
        cleanup_test_dir(&self.test_dir);
    }
}

impl Drop for ScenarioExecutor {
    fn drop(&mut self) {
        // Keep artifacts when the test panicked
        if !std::thread::panicking() {
            self.cleanup();
        } else {
            println!("Test panicked, keeping test directory for debugging: {}", self.test_dir.display());
        }
    }
}
