//! Client side of one AMQP 0-9-1 connection.
//!
//! The lifecycle owns the transport and the state machine. Handshake, receive
//! loop and close run on the caller's thread; observers are called inline in
//! frame order.

use crate::frame::{ConnectionFrame, TuneParams};
use crate::observer::ConnectionObserver;
use crate::state::{ConnectionState, ConnectionStateMachine, FlowState, StateTransition};
use crate::transport::{TcpTransport, Transport};
use prox_common::{HarnessError, HarnessResult, SharedSink};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;
pub const DEFAULT_FRAME_MAX: u32 = 131072;

/// Idle tick length when heartbeats are disabled.
const IDLE_WITHOUT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Consecutive silent heartbeat intervals before the peer is declared dead.
const MISSED_HEARTBEATS_LIMIT: u32 = 2;

/// Connection parameters, fixed once `connect` starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// `host` or `host:port`
    pub host: String,
    /// Requested heartbeat interval; 0 disables heartbeats.
    pub heartbeat_interval_seconds: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, heartbeat_interval_seconds: u16) -> Self {
        Self {
            host: host.into(),
            heartbeat_interval_seconds,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            connect_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Split `host` into host name and port, defaulting the port to 5672.
    pub fn endpoint(&self) -> HarnessResult<(String, u16)> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(HarnessError::configuration("connection host is empty"));
        }

        // Bracketed IPv6 literal, with or without a port
        if let Some(rest) = host.strip_prefix('[') {
            let (address, tail) = rest
                .split_once(']')
                .ok_or_else(|| HarnessError::configuration(format!("invalid host '{}'", host)))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(host, port)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(HarnessError::configuration(format!("invalid host '{}'", host))),
            };
            return Ok((address.to_string(), port));
        }

        match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') => Ok((name.to_string(), parse_port(host, port)?)),
            _ => Ok((host.to_string(), DEFAULT_PORT)),
        }
    }
}

fn parse_port(host: &str, port: &str) -> HarnessResult<u16> {
    port.parse::<u16>()
        .map_err(|_| HarnessError::configuration(format!("invalid port in host '{}'", host)))
}

/// What a connection does once it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePolicy {
    /// Close immediately after the handshake (liveness check).
    CloseOnOpen,
    /// Stay in the receive loop until the peer closes or the transport fails.
    Observe,
}

/// How a connection ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed { reply_code: u16, reply_text: String },
    LocalClosed { acknowledged: bool },
    AlreadyTerminated,
}

/// Negotiate tuning from the client's requested heartbeat and the server's proposal.
///
/// A zero heartbeat on either side means "no preference", so the larger value
/// wins; otherwise the smaller one does. A client asking for 0 disables
/// heartbeats outright.
pub fn negotiate_tuning(client_heartbeat: u16, server: &TuneParams) -> TuneParams {
    let heartbeat = if client_heartbeat == 0 {
        0
    } else if server.heartbeat == 0 {
        client_heartbeat
    } else {
        client_heartbeat.min(server.heartbeat)
    };

    TuneParams {
        channel_max: if server.channel_max == 0 {
            DEFAULT_CHANNEL_MAX
        } else {
            server.channel_max
        },
        frame_max: if server.frame_max == 0 {
            DEFAULT_FRAME_MAX
        } else {
            server.frame_max
        },
        heartbeat,
    }
}

pub struct ConnectionLifecycle<O: ConnectionObserver> {
    machine: ConnectionStateMachine,
    observer: O,
    sink: SharedSink,
    transport: Option<Box<dyn Transport>>,
    config: Option<ConnectionConfig>,
    tuning: Option<TuneParams>,
    server_properties: BTreeMap<String, String>,
}

impl<O: ConnectionObserver> ConnectionLifecycle<O> {
    pub fn new(observer: O, sink: SharedSink) -> Self {
        Self {
            machine: ConnectionStateMachine::new("amqp-connection"),
            observer,
            sink,
            transport: None,
            config: None,
            tuning: None,
            server_properties: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.current_state()
    }

    pub fn flow(&self) -> &FlowState {
        self.machine.flow()
    }

    pub fn history(&self) -> &[StateTransition] {
        self.machine.state_history()
    }

    /// Negotiated tuning, once the handshake got that far.
    pub fn tuning(&self) -> Option<TuneParams> {
        self.tuning
    }

    pub fn server_properties(&self) -> &BTreeMap<String, String> {
        &self.server_properties
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Open a TCP connection to `config.host` and run the handshake.
    pub fn connect(&mut self, config: ConnectionConfig) -> HarnessResult<()> {
        self.connect_via(config, |config| {
            let (host, port) = config.endpoint()?;
            let transport = TcpTransport::connect(&host, port, config.connect_timeout)?;
            Ok(Box::new(transport) as Box<dyn Transport>)
        })
    }

    /// Run the handshake over a transport produced by `dial`.
    pub fn connect_via<F>(&mut self, config: ConnectionConfig, dial: F) -> HarnessResult<()>
    where
        F: FnOnce(&ConnectionConfig) -> HarnessResult<Box<dyn Transport>>,
    {
        self.machine
            .transition_to(ConnectionState::Connecting, Some(format!("connecting to {}", config.host)))?;
        self.sink.info("connection_connecting", &config.host);
        self.config = Some(config.clone());

        let result = dial(&config).and_then(|transport| {
            self.transport = Some(transport);
            self.handshake(&config)
        });
        result.map_err(|e| self.fail(e))
    }

    /// Connect, then either close at once or observe until the connection ends.
    pub fn run(&mut self, config: ConnectionConfig, policy: ReceivePolicy) -> HarnessResult<CloseReason> {
        self.connect(config)?;
        match policy {
            ReceivePolicy::CloseOnOpen => Ok(self.close()),
            ReceivePolicy::Observe => self.receive_loop(),
        }
    }

    /// Receive and dispatch frames until the connection terminates.
    ///
    /// A peer `connection.close` ends the loop with `Ok`; any transport or
    /// protocol failure, including a silent peer, ends it with `Err`.
    pub fn receive_loop(&mut self) -> HarnessResult<CloseReason> {
        if self.state() != ConnectionState::Open {
            return Err(HarnessError::invalid_state(
                self.target(),
                ConnectionState::Open.to_string(),
                self.state().to_string(),
            ));
        }

        let heartbeat = self.heartbeat_interval();
        let mut missed = 0u32;
        let mut last_received = Instant::now();
        let mut last_sent = Instant::now();

        loop {
            let frame = match self.receive() {
                Ok(frame) => frame,
                Err(e) => return Err(self.fail(e)),
            };

            let Some(frame) = frame else {
                let Some(interval) = heartbeat else {
                    continue;
                };
                missed += 1;
                if missed >= MISSED_HEARTBEATS_LIMIT {
                    let error = HarnessError::timeout(self.target(), "await peer heartbeat", last_received.elapsed());
                    return Err(self.fail(error));
                }
                self.sink.debug(
                    "heartbeat_missed",
                    &format!("nothing received for {:?}", interval * missed),
                );
                if let Err(e) = self.send(&ConnectionFrame::Heartbeat) {
                    return Err(self.fail(e));
                }
                last_sent = Instant::now();
                continue;
            };

            missed = 0;
            last_received = Instant::now();

            match frame {
                ConnectionFrame::Close {
                    reply_code,
                    reply_text,
                    ..
                } => {
                    let _ = self.send(&ConnectionFrame::CloseOk);
                    self.finish_closed(format!("peer closed: {} {}", reply_code, reply_text));
                    self.sink.info(
                        "connection_closed_by_peer",
                        &format!("{} {}", reply_code, reply_text),
                    );
                    return Ok(CloseReason::PeerClosed {
                        reply_code,
                        reply_text,
                    });
                }
                ConnectionFrame::Blocked { reason } => {
                    self.machine.set_blocked(&reason);
                    self.observer.on_blocked(&reason);
                }
                ConnectionFrame::Unblocked => {
                    self.machine.set_unblocked();
                    self.observer.on_unblocked();
                }
                other => self.observer.on_frame(&other),
            }

            if let Some(interval) = heartbeat {
                if last_sent.elapsed() >= interval {
                    if let Err(e) = self.send(&ConnectionFrame::Heartbeat) {
                        return Err(self.fail(e));
                    }
                    last_sent = Instant::now();
                }
            }
        }
    }

    /// Close from our side and wait, bounded by `close_timeout`, for `close-ok`.
    ///
    /// Always ends in `Closed` unless the connection had already terminated.
    pub fn close(&mut self) -> CloseReason {
        match self.state() {
            state if state.is_terminal() => return CloseReason::AlreadyTerminated,
            ConnectionState::Disconnected => {
                self.finish_closed("closed before connecting".to_string());
                return CloseReason::LocalClosed { acknowledged: false };
            }
            _ => {}
        }

        let close_timeout = self
            .config
            .as_ref()
            .map(|c| c.close_timeout)
            .unwrap_or_else(|| Duration::from_secs(5));

        let acknowledged = match self
            .send(&ConnectionFrame::normal_close())
            .and_then(|_| self.await_close_ok(close_timeout))
        {
            Ok(true) => true,
            Ok(false) => {
                self.sink.warn(
                    "close_not_acknowledged",
                    &format!("no close-ok within {:?}", close_timeout),
                );
                false
            }
            Err(e) => {
                self.sink.warn("close_not_acknowledged", &e.to_string());
                false
            }
        };

        self.finish_closed(format!("closed locally, acknowledged={}", acknowledged));
        self.sink.info("connection_closed", &self.target());
        CloseReason::LocalClosed { acknowledged }
    }

    fn handshake(&mut self, config: &ConnectionConfig) -> HarnessResult<()> {
        self.set_idle_timeout(config.connect_timeout)?;
        self.send(&ConnectionFrame::ProtocolHeader)?;

        let server_properties = match self.expect("connection.start")? {
            ConnectionFrame::Start {
                server_properties,
                mechanisms,
                ..
            } => {
                if !mechanisms.split_whitespace().any(|m| m == "PLAIN") {
                    return Err(HarnessError::protocol(
                        self.target(),
                        format!("server does not offer PLAIN authentication (offers '{}')", mechanisms),
                    ));
                }
                server_properties
            }
            other => return Err(self.unexpected("connection.start", &other)),
        };

        self.send(&ConnectionFrame::StartOk {
            client_properties: client_properties(),
            mechanism: "PLAIN".to_string(),
            response: format!("\0{}\0{}", config.username, config.password),
            locale: "en_US".to_string(),
        })?;

        let tuning = match self.expect("connection.tune")? {
            ConnectionFrame::Tune(server) => negotiate_tuning(config.heartbeat_interval_seconds, &server),
            other => return Err(self.unexpected("connection.tune", &other)),
        };
        self.send(&ConnectionFrame::TuneOk(tuning))?;
        self.transport()?.set_frame_max(tuning.frame_max);
        self.tuning = Some(tuning);
        self.observer.on_tune_ok(&tuning);

        self.send(&ConnectionFrame::Open {
            virtual_host: config.virtual_host.clone(),
        })?;
        self.expect("connection.open-ok")?;

        self.machine
            .transition_to(ConnectionState::Open, Some("open-ok received".to_string()))?;
        let idle = self.heartbeat_interval().unwrap_or(IDLE_WITHOUT_HEARTBEAT);
        self.set_idle_timeout(idle)?;

        self.server_properties = server_properties;
        self.observer.on_open(&self.server_properties);
        self.sink.info(
            "connection_open",
            &format!("{} vhost={} heartbeat={}s", self.target(), config.virtual_host, tuning.heartbeat),
        );
        Ok(())
    }

    /// Next handshake frame, skipping heartbeats. A peer close ends the
    /// connection as `Closed` and fails the handshake.
    fn expect(&mut self, expected: &str) -> HarnessResult<ConnectionFrame> {
        let started = Instant::now();
        loop {
            match self.receive()? {
                None => {
                    return Err(HarnessError::timeout(
                        self.target(),
                        format!("await {}", expected),
                        started.elapsed(),
                    ));
                }
                Some(ConnectionFrame::Heartbeat) => continue,
                Some(ConnectionFrame::Close {
                    reply_code,
                    reply_text,
                    ..
                }) => {
                    let _ = self.send(&ConnectionFrame::CloseOk);
                    self.finish_closed(format!("peer closed during handshake: {} {}", reply_code, reply_text));
                    return Err(HarnessError::protocol(
                        self.target(),
                        format!("peer closed the connection during handshake: {} {}", reply_code, reply_text),
                    ));
                }
                Some(frame) if frame.name() == expected => return Ok(frame),
                Some(other) => return Err(self.unexpected(expected, &other)),
            }
        }
    }

    fn await_close_ok(&mut self, timeout: Duration) -> HarnessResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            self.set_idle_timeout(remaining)?;
            match self.receive()? {
                None => continue,
                Some(ConnectionFrame::CloseOk) => return Ok(true),
                Some(ConnectionFrame::Close { .. }) => {
                    // Both sides closed at once
                    self.send(&ConnectionFrame::CloseOk)?;
                    return Ok(true);
                }
                Some(other) => self.observer.on_frame(&other),
            }
        }
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        self.tuning
            .filter(|t| t.heartbeat > 0)
            .map(|t| Duration::from_secs(u64::from(t.heartbeat)))
    }

    fn target(&self) -> String {
        self.config
            .as_ref()
            .map(|c| c.host.clone())
            .unwrap_or_else(|| "amqp-connection".to_string())
    }

    fn unexpected(&self, expected: &str, received: &ConnectionFrame) -> HarnessError {
        HarnessError::protocol(
            self.target(),
            format!("expected {} but received {}", expected, received.name()),
        )
    }

    fn transport(&mut self) -> HarnessResult<&mut Box<dyn Transport>> {
        let target = self.target();
        self.transport
            .as_mut()
            .ok_or_else(|| HarnessError::transport(target, "transport is not connected"))
    }

    fn send(&mut self, frame: &ConnectionFrame) -> HarnessResult<()> {
        self.transport()?.send(frame)
    }

    fn receive(&mut self) -> HarnessResult<Option<ConnectionFrame>> {
        self.transport()?.receive()
    }

    fn set_idle_timeout(&mut self, timeout: Duration) -> HarnessResult<()> {
        self.transport()?.set_idle_timeout(timeout)
    }

    fn finish_closed(&mut self, reason: String) {
        if !self.state().is_terminal() {
            let _ = self.machine.transition_to(ConnectionState::Closed, Some(reason));
        }
        self.release_transport();
    }

    /// Move to `Failed` unless already terminal, and hand the error back.
    fn fail(&mut self, error: HarnessError) -> HarnessError {
        if !self.state().is_terminal() {
            let _ = self.machine.transition_to_failed(error.to_string());
            self.sink.error("connection_failed", &error.to_string());
        }
        self.release_transport();
        error
    }

    fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
    }
}

impl<O: ConnectionObserver> Drop for ConnectionLifecycle<O> {
    fn drop(&mut self) {
        if self.transport.is_some() && !self.state().is_terminal() {
            self.close();
        }
    }
}

fn client_properties() -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert("product".to_string(), "prox-harness".to_string());
    properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
    properties.insert("platform".to_string(), "Rust".to_string());
    properties
}
