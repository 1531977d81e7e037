//! One scenario: start the proxy, wait for it, load it, assert, tear down.
//!
//! The proxy is started under a [`ProcessGuard`], so it is stopped exactly
//! once on every path out of [`ScenarioRunner::run`], unwinding included.
//! Failures are reported only after that stop has happened.

use crate::config::ScenarioConfig;
use crate::liveness::{AmqpLivenessCheck, LivenessCheck};
use prox_common::{
    HarnessResult, LoadTestParameters, ProcessExit, ProcessSpec, ProxyEndpoint, SharedSink,
};
use prox_connection::CloseReason;
use prox_monitoring::{ReadinessCheck, ReadinessProbe};
use prox_process::{
    LoadTestInvocation, ManagedProcess, ProcessGuard, ProxyProcess, StopOutcome, Workload,
    WorkloadCommand,
};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Environment variable naming the directory that holds the proxy binary.
pub const PROXY_BIN_DIR_ENV: &str = "AMQPPROX_BIN_DIR";
pub const PROXY_BINARY: &str = "amqpprox";

/// `--listenPort <p> --destinationPort <p> --destinationDNS <host>`
pub fn proxy_arguments(endpoint: &ProxyEndpoint) -> Vec<String> {
    vec![
        "--listenPort".to_string(),
        endpoint.listen_port.to_string(),
        "--destinationPort".to_string(),
        endpoint.destination_port.to_string(),
        "--destinationDNS".to_string(),
        endpoint.destination_host.clone(),
    ]
}

/// Proxy binary: the configured one, else `<bin_dir>/amqpprox`, else `amqpprox` on `PATH`.
pub fn resolve_proxy_executable(configured: Option<&str>, bin_dir: Option<&str>) -> String {
    match (configured, bin_dir) {
        (Some(executable), _) => executable.to_string(),
        (None, Some(dir)) if !dir.is_empty() => Path::new(dir).join(PROXY_BINARY).display().to_string(),
        _ => PROXY_BINARY.to_string(),
    }
}

/// Everything a run needs besides its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioPlan {
    pub name: String,
    pub endpoint: ProxyEndpoint,
    pub proxy_spec: ProcessSpec,
    pub params: LoadTestParameters,
}

impl ScenarioPlan {
    /// Plan for the proxy binary at `executable` with the standard endpoint flags.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        endpoint: ProxyEndpoint,
        params: LoadTestParameters,
    ) -> Self {
        let proxy_spec = ProcessSpec::new(executable).args(proxy_arguments(&endpoint));
        Self {
            name: name.into(),
            endpoint,
            proxy_spec,
            params,
        }
    }

    pub fn from_config(config: &ScenarioConfig) -> Self {
        let bin_dir = std::env::var(PROXY_BIN_DIR_ENV).ok();
        let executable = resolve_proxy_executable(config.proxy.executable.as_deref(), bin_dir.as_deref());

        let mut plan = Self::new(
            &config.scenario.name,
            executable,
            config.endpoint(),
            config.load_test_parameters(),
        );
        plan.proxy_spec = plan
            .proxy_spec
            .args(config.proxy.extra_args.iter().cloned())
            .envs(config.proxy.environment.clone());
        plan.proxy_spec.log_file = config.proxy.log_file.clone();
        debug!("Scenario {} proxy command: {}", plan.name, plan.proxy_spec.command_line());
        plan
    }
}

/// Result of a successful scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub name: String,
    pub ready_after: Duration,
    pub workload_exit: ProcessExit,
    pub proxy_stop: StopOutcome,
    pub liveness: Option<CloseReason>,
}

struct StepsOutcome {
    ready_after: Duration,
    workload_exit: ProcessExit,
    liveness: Option<CloseReason>,
}

pub struct ScenarioRunner<P, R, W>
where
    P: ProxyProcess,
    R: ReadinessCheck,
    W: Workload,
{
    plan: ScenarioPlan,
    proxy: P,
    readiness: R,
    workload: W,
    liveness: Option<Box<dyn LivenessCheck>>,
    sink: SharedSink,
}

/// Runner over real processes and sockets.
pub type ProcessScenarioRunner = ScenarioRunner<ManagedProcess, ReadinessProbe, LoadTestInvocation>;

impl<P, R, W> ScenarioRunner<P, R, W>
where
    P: ProxyProcess,
    R: ReadinessCheck,
    W: Workload,
{
    pub fn new(plan: ScenarioPlan, proxy: P, readiness: R, workload: W, sink: SharedSink) -> Self {
        Self {
            plan,
            proxy,
            readiness,
            workload,
            liveness: None,
            sink,
        }
    }

    /// Run a liveness check after the workload succeeds, before teardown.
    pub fn with_liveness(mut self, check: impl LivenessCheck + 'static) -> Self {
        self.liveness = Some(Box::new(check));
        self
    }

    pub fn plan(&self) -> &ScenarioPlan {
        &self.plan
    }

    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    pub fn run(&mut self) -> HarnessResult<ScenarioReport> {
        let name = self.plan.name.clone();
        self.sink.info(
            "scenario_starting",
            &format!(
                "{}: proxy {} -> {}:{}",
                name,
                self.plan.endpoint.listen_address(),
                self.plan.endpoint.destination_host,
                self.plan.endpoint.destination_port
            ),
        );
        let started = Instant::now();

        let (guard, pid) = match ProcessGuard::start(&mut self.proxy, &self.plan.proxy_spec) {
            Ok(started) => started,
            Err(e) => {
                self.sink.error("scenario_failed", &format!("{}: {}", name, e));
                return Err(e);
            }
        };
        self.sink.debug("proxy_started", &format!("{} PID {}", name, pid));

        let outcome = run_steps(
            &self.plan,
            &self.readiness,
            &mut self.workload,
            &mut self.liveness,
        );

        let proxy_stop = guard.release();
        self.sink.info("proxy_stopped", &format!("{}: {:?}", name, proxy_stop));

        match outcome {
            Ok(steps) => {
                self.sink.info(
                    "scenario_passed",
                    &format!("{} in {:?} (ready after {:?})", name, started.elapsed(), steps.ready_after),
                );
                Ok(ScenarioReport {
                    name,
                    ready_after: steps.ready_after,
                    workload_exit: steps.workload_exit,
                    proxy_stop,
                    liveness: steps.liveness,
                })
            }
            Err(e) => {
                self.sink.error("scenario_failed", &format!("{}: {}", name, e));
                Err(e)
            }
        }
    }
}

fn run_steps<R, W>(
    plan: &ScenarioPlan,
    readiness: &R,
    workload: &mut W,
    liveness: &mut Option<Box<dyn LivenessCheck>>,
) -> HarnessResult<StepsOutcome>
where
    R: ReadinessCheck,
    W: Workload,
{
    let report = readiness.wait_until_ready(&plan.endpoint.listen_host, plan.endpoint.listen_port)?;
    let workload_exit = workload.run_checked(&plan.params)?;
    let liveness = match liveness {
        Some(check) => Some(check.check(&plan.endpoint)?),
        None => None,
    };

    Ok(StepsOutcome {
        ready_after: report.elapsed,
        workload_exit,
        liveness,
    })
}

impl ProcessScenarioRunner {
    /// Real proxy process, TCP readiness probe and spawned workload, as configured.
    pub fn from_config(config: &ScenarioConfig, sink: SharedSink) -> Self {
        let plan = ScenarioPlan::from_config(config);

        let proxy = ManagedProcess::new(PROXY_BINARY, sink.clone()).with_stop_grace(config.proxy.stop_grace);
        let readiness = ReadinessProbe::new(config.readiness_config(), sink.clone());

        let load_test = &config.load_test;
        let mut command = match (&load_test.perf_tester_manifest, &load_test.program) {
            (Some(manifest), _) => WorkloadCommand::cargo_perf_tester(manifest),
            (None, Some(program)) => WorkloadCommand::new(program),
            // Rejected by validation
            (None, None) => WorkloadCommand::new(""),
        };
        command = command.leading_args(load_test.leading_args.iter().cloned());
        for (key, value) in &load_test.environment {
            command = command.env(key, value);
        }

        let mut workload = LoadTestInvocation::new(&config.scenario.name, command, sink.clone());
        if let Some(timeout) = load_test.timeout {
            workload = workload.with_timeout(timeout);
        }
        if let Some(ref log_file) = load_test.log_file {
            workload = workload.with_log_file(log_file);
        }

        let mut runner = Self::new(plan, proxy, readiness, workload, sink.clone());
        if let Some(ref liveness) = config.liveness {
            runner = runner.with_liveness(
                AmqpLivenessCheck::new(liveness.heartbeat, &liveness.virtual_host, sink)
                    .with_close_timeout(liveness.close_timeout),
            );
        }
        runner
    }
}
