use prox_common::{HarnessResult, ProxyEndpoint, SharedSink};
use prox_connection::{CloseReason, ConnectionConfig, ConnectionLifecycle, LoggingObserver, ReceivePolicy};
use std::time::Duration;

/// Post-workload check that the proxy still completes an AMQP handshake.
pub trait LivenessCheck {
    fn check(&mut self, endpoint: &ProxyEndpoint) -> HarnessResult<CloseReason>;
}

/// Opens one connection through the proxy and closes it straight away.
pub struct AmqpLivenessCheck {
    heartbeat: u16,
    virtual_host: String,
    close_timeout: Duration,
    sink: SharedSink,
}

impl AmqpLivenessCheck {
    pub fn new(heartbeat: u16, virtual_host: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            heartbeat,
            virtual_host: virtual_host.into(),
            close_timeout: Duration::from_secs(5),
            sink,
        }
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

impl LivenessCheck for AmqpLivenessCheck {
    fn check(&mut self, endpoint: &ProxyEndpoint) -> HarnessResult<CloseReason> {
        let config = ConnectionConfig::new(endpoint.listen_address(), self.heartbeat)
            .with_virtual_host(&self.virtual_host)
            .with_close_timeout(self.close_timeout);

        let mut lifecycle = ConnectionLifecycle::new(LoggingObserver::new(self.sink.clone()), self.sink.clone());
        lifecycle.run(config, ReceivePolicy::CloseOnOpen)
    }
}
