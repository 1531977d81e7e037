use super::*;
use anyhow::{anyhow, Result};

/// Validate the complete scenario
pub fn validate_config(config: &ScenarioConfig) -> Result<()> {
    validate_scenario_options(&config.scenario)?;
    validate_proxy_config(&config.proxy)?;
    validate_readiness_settings(&config.readiness)?;
    validate_load_test_config(&config.load_test)?;

    if let Some(ref liveness) = config.liveness {
        validate_liveness_config(liveness)?;
    }

    Ok(())
}

fn validate_scenario_options(options: &ScenarioOptions) -> Result<()> {
    if options.name.trim().is_empty() {
        return Err(anyhow!("Scenario name cannot be empty"));
    }
    Ok(())
}

fn validate_proxy_config(proxy: &ProxyConfig) -> Result<()> {
    if let Some(ref executable) = proxy.executable {
        if executable.trim().is_empty() {
            return Err(anyhow!("Proxy executable cannot be empty when specified"));
        }
    }

    if proxy.listen_port == 0 {
        return Err(anyhow!("Proxy listen port must be between 1 and 65535"));
    }

    if proxy.destination_port == 0 {
        return Err(anyhow!("Proxy destination port must be between 1 and 65535"));
    }

    if proxy.listen_host.trim().is_empty() || proxy.destination_host.trim().is_empty() {
        return Err(anyhow!("Proxy listen and destination hosts cannot be empty"));
    }

    Ok(())
}

fn validate_readiness_settings(readiness: &ReadinessSettings) -> Result<()> {
    if readiness.poll_interval.is_zero() {
        return Err(anyhow!("Readiness poll interval must be greater than 0"));
    }

    if readiness.poll_interval > readiness.max_wait {
        return Err(anyhow!(
            "Readiness poll interval ({:?}) cannot exceed max wait ({:?})",
            readiness.poll_interval,
            readiness.max_wait
        ));
    }

    Ok(())
}

fn validate_load_test_config(load_test: &LoadTestConfig) -> Result<()> {
    match (&load_test.program, &load_test.perf_tester_manifest) {
        (Some(program), None) if program.trim().is_empty() => {
            return Err(anyhow!("Load test program cannot be empty"));
        }
        (Some(_), None) | (None, Some(_)) => {}
        (None, None) => {
            return Err(anyhow!("Load test needs either program or perf_tester_manifest"));
        }
        (Some(_), Some(_)) => {
            return Err(anyhow!("Load test program and perf_tester_manifest are mutually exclusive"));
        }
    }

    for (field, value) in [
        ("clients", load_test.clients),
        ("max_threads", load_test.max_threads),
        ("num_messages", load_test.num_messages),
    ] {
        if value == 0 {
            return Err(anyhow!("Load test {} must be greater than 0", field));
        }
    }

    if load_test.timeout == Some(Duration::ZERO) {
        return Err(anyhow!("Load test timeout must be greater than 0"));
    }

    Ok(())
}

fn validate_liveness_config(liveness: &LivenessConfig) -> Result<()> {
    if liveness.virtual_host.is_empty() {
        return Err(anyhow!("Liveness virtual host cannot be empty"));
    }
    Ok(())
}
