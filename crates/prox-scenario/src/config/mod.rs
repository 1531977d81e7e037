use anyhow::{Context, Result};
use prox_common::{LoadTestParameters, ProxyEndpoint};
use prox_monitoring::ReadinessConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod validation;

/// Top-level scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub scenario: ScenarioOptions,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    pub load_test: LoadTestConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<LivenessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOptions {
    pub name: String,
}

/// The proxy under test and the addresses it is started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Path or bare name of the proxy binary. Resolved from
    /// `AMQPPROX_BIN_DIR` (or `amqpprox` on `PATH`) when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default = "default_host")]
    pub listen_host: String,
    pub listen_port: u16,
    #[serde(default = "default_host")]
    pub destination_host: String,
    pub destination_port: u16,
    /// Appended after the endpoint flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_stop_grace", with = "duration_serde")]
    pub stop_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessSettings {
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_wait", with = "duration_serde")]
    pub max_wait: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_wait: default_max_wait(),
        }
    }
}

/// The workload and its parameters.
///
/// Either `program` or `perf_tester_manifest` names what to run; the
/// manifest form runs the Rust performance tester through cargo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_tester_manifest: Option<PathBuf>,
    #[serde(default)]
    pub leading_args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Defaults to the proxy's AMQP URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    /// Defaults to `127.0.0.1:<proxy destination port>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
    pub message_size: u64,
    pub num_messages: u64,
    pub max_threads: u64,
    pub clients: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "option_duration_serde"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Post-run AMQP connection through the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_close_timeout", with = "duration_serde")]
    pub close_timeout: Duration,
}

impl ScenarioConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read scenario file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        let config: ScenarioConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML scenario")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new(
            &self.proxy.listen_host,
            self.proxy.listen_port,
            &self.proxy.destination_host,
            self.proxy.destination_port,
        )
    }

    pub fn readiness_config(&self) -> ReadinessConfig {
        ReadinessConfig {
            poll_interval: self.readiness.poll_interval,
            max_wait: self.readiness.max_wait,
        }
    }

    /// Workload parameters with the endpoint-derived defaults filled in.
    pub fn load_test_parameters(&self) -> LoadTestParameters {
        let endpoint = self.endpoint();
        let load_test = &self.load_test;
        LoadTestParameters {
            target_url: load_test
                .target_url
                .clone()
                .unwrap_or_else(|| endpoint.amqp_url()),
            listen_address: load_test
                .listen_address
                .clone()
                .unwrap_or_else(|| format!("127.0.0.1:{}", endpoint.destination_port)),
            message_size_bytes: load_test.message_size,
            num_messages: load_test.num_messages,
            max_threads: load_test.max_threads,
            client_count: load_test.clients,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_max_wait() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat() -> u16 {
    4
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(5)
}

// Custom serialization for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn format_duration(duration: &Duration) -> String {
        if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" before "s", since "ms" ends with 's'
        if let Some(num_str) = s.strip_suffix("ms") {
            let millis: u64 = num_str.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_millis(millis))
        } else if let Some(num_str) = s.strip_suffix('s') {
            let secs: u64 = num_str.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_secs(secs))
        } else if let Some(num_str) = s.strip_suffix('m') {
            let mins: u64 = num_str.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_secs(mins * 60))
        } else {
            Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
        }
    }
}

// Custom serialization for Option<Duration>
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&super::duration_serde::format_duration(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => super::duration_serde::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
