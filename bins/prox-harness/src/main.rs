use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;
use tracing::{error, info};

use prox_common::TracingSink;
use prox_connection::{CloseReason, ConnectionConfig, ConnectionLifecycle, LoggingObserver, ReceivePolicy};
use prox_monitoring::{ReadinessCheck, ReadinessConfig, ReadinessProbe};
use prox_scenario::{ProcessScenarioRunner, ScenarioConfig};

/// AMQP proxy test harness
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one scenario from a YAML file
    Scenario {
        /// Scenario file path (YAML)
        #[arg(short, long, value_name = "FILE")]
        config: String,
    },
    /// Open one AMQP connection and report how it ends
    Connect {
        /// host or host:port
        #[arg(long, default_value = "localhost:5672")]
        host: String,

        /// Requested heartbeat interval in seconds (0 disables)
        #[arg(long, default_value_t = 4)]
        heartbeat: u16,

        #[arg(long, value_enum, default_value_t = Mode::CloseOnOpen)]
        mode: Mode,

        #[arg(long, default_value = "/")]
        vhost: String,
    },
    /// Wait until a TCP endpoint accepts connections
    Probe {
        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long)]
        port: u16,

        /// Milliseconds between attempts
        #[arg(long, default_value_t = 500)]
        poll_interval_ms: u64,

        /// Seconds before giving up
        #[arg(long, default_value_t = 10)]
        max_wait_secs: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    CloseOnOpen,
    Observe,
}

impl From<Mode> for ReceivePolicy {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::CloseOnOpen => ReceivePolicy::CloseOnOpen,
            Mode::Observe => ReceivePolicy::Observe,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    initialize_logging(args.debug)?;

    match args.command {
        Command::Scenario { config } => run_scenario(&config),
        Command::Connect {
            host,
            heartbeat,
            mode,
            vhost,
        } => run_connect(host, heartbeat, mode, vhost),
        Command::Probe {
            host,
            port,
            poll_interval_ms,
            max_wait_secs,
        } => run_probe(&host, port, poll_interval_ms, max_wait_secs),
    }
}

fn run_scenario(path: &str) -> Result<()> {
    info!("Scenario file: {}", path);
    let config = ScenarioConfig::load_from_file(path)?;

    let mut runner = ProcessScenarioRunner::from_config(&config, TracingSink::shared("scenario"));
    match runner.run() {
        Ok(report) => {
            info!(
                "Scenario {} passed: ready after {:?}, workload {}, proxy {:?}",
                report.name, report.ready_after, report.workload_exit, report.proxy_stop
            );
            if let Some(liveness) = report.liveness {
                info!("Liveness connection ended with {:?}", liveness);
            }
            Ok(())
        }
        Err(e) => {
            error!("Scenario {} failed: {}", config.scenario.name, e);
            Err(e).with_context(|| format!("scenario {} failed", config.scenario.name))
        }
    }
}

fn run_connect(host: String, heartbeat: u16, mode: Mode, vhost: String) -> Result<()> {
    let sink = TracingSink::shared("connection");
    let mut lifecycle = ConnectionLifecycle::new(LoggingObserver::new(sink.clone()), sink);
    let config = ConnectionConfig::new(host, heartbeat).with_virtual_host(vhost);

    info!("Connecting to {} ({:?})", config.host, mode);
    let reason = lifecycle
        .run(config, mode.into())
        .context("connection terminated with an error")?;

    match reason {
        CloseReason::PeerClosed {
            reply_code,
            reply_text,
        } => info!("Peer closed the connection: {} {}", reply_code, reply_text),
        CloseReason::LocalClosed { acknowledged } => {
            info!("Connection closed (acknowledged: {})", acknowledged)
        }
        CloseReason::AlreadyTerminated => info!("Connection had already terminated"),
    }
    Ok(())
}

fn run_probe(host: &str, port: u16, poll_interval_ms: u64, max_wait_secs: u64) -> Result<()> {
    let probe = ReadinessProbe::new(
        ReadinessConfig {
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            max_wait: Duration::from_secs(max_wait_secs),
        },
        TracingSink::shared("readiness"),
    );

    let report = probe
        .wait_until_ready(host, port)
        .with_context(|| format!("{}:{} never became ready", host, port))?;
    info!(
        "{}:{} ready after {} attempt(s), {:?}",
        host, port, report.attempts, report.elapsed
    );
    Ok(())
}

fn initialize_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    Ok(())
}
