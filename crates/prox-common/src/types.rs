//! Core domain types shared by the harness crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Network addresses the proxy under test is configured with.
///
/// The harness connects to `listen_host:listen_port`; the proxy forwards to
/// `destination_host:destination_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub listen_host: String,
    pub listen_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
}

impl ProxyEndpoint {
    pub fn new(
        listen_host: impl Into<String>,
        listen_port: u16,
        destination_host: impl Into<String>,
        destination_port: u16,
    ) -> Self {
        Self {
            listen_host: listen_host.into(),
            listen_port,
            destination_host: destination_host.into(),
            destination_port,
        }
    }

    /// `host:port` the proxy listens on.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// AMQP URL clients use to reach the proxy.
    pub fn amqp_url(&self) -> String {
        format!("amqp://{}:{}", self.listen_host, self.listen_port)
    }
}

/// Describes one externally spawned process.
///
/// Arguments keep their order; environment entries are applied on top of the
/// harness's own environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub executable_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Receives both stdout and stderr when set; otherwise output is inherited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(executable_path: impl Into<String>) -> Self {
        Self {
            executable_path: executable_path.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: None,
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Human readable command line, for log output only.
    pub fn command_line(&self) -> String {
        std::iter::once(self.executable_path.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Parameters of one load test run. Every field is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTestParameters {
    /// AMQP URL of the proxy under test, e.g. `amqp://localhost:5672`.
    pub target_url: String,
    /// Address the workload's own dummy broker listens on.
    pub listen_address: String,
    pub message_size_bytes: u64,
    pub num_messages: u64,
    pub max_threads: u64,
    pub client_count: u64,
}

/// Portable exit status of an external process.
///
/// `std::process::ExitStatus` cannot be constructed portably, which makes it
/// awkward for test doubles; this carries the same information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Zero exit code, i.e. normal termination.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}
