//! Connection event observers.
//!
//! Callbacks run on the receive thread, in frame order. They must not do
//! network I/O on the connection; the lifecycle owns the transport.

use crate::frame::{ConnectionFrame, TuneParams};
use parking_lot::Mutex;
use prox_common::SharedSink;
use std::collections::BTreeMap;
use std::sync::Arc;

pub trait ConnectionObserver: Send {
    fn on_open(&mut self, _server_properties: &BTreeMap<String, String>) {}

    fn on_tune_ok(&mut self, _tuning: &TuneParams) {}

    fn on_blocked(&mut self, _reason: &str) {}

    fn on_unblocked(&mut self) {}

    /// Every frame not covered by a dedicated callback, heartbeats included.
    fn on_frame(&mut self, _frame: &ConnectionFrame) {}
}

/// Reports each event to a sink.
pub struct LoggingObserver {
    sink: SharedSink,
}

impl LoggingObserver {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }
}

impl ConnectionObserver for LoggingObserver {
    fn on_open(&mut self, server_properties: &BTreeMap<String, String>) {
        let product = server_properties
            .get("product")
            .map(String::as_str)
            .unwrap_or("unknown");
        self.sink.info("connection_opened", &format!("server product: {}", product));
    }

    fn on_tune_ok(&mut self, tuning: &TuneParams) {
        self.sink.info(
            "connection_tuned",
            &format!(
                "channel_max={} frame_max={} heartbeat={}s",
                tuning.channel_max, tuning.frame_max, tuning.heartbeat
            ),
        );
    }

    fn on_blocked(&mut self, reason: &str) {
        self.sink.warn("connection_blocked", reason);
    }

    fn on_unblocked(&mut self) {
        self.sink.info("connection_unblocked", "");
    }

    fn on_frame(&mut self, frame: &ConnectionFrame) {
        self.sink.debug("frame_received", frame.name());
    }
}

/// One observed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Open,
    TuneOk(TuneParams),
    Blocked(String),
    Unblocked,
    Frame(String),
}

/// Records callbacks in order; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    /// Events other than generic frames.
    pub fn handler_events(&self) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| !matches!(e, ObservedEvent::Frame(_)))
            .cloned()
            .collect()
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().push(event);
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_open(&mut self, _server_properties: &BTreeMap<String, String>) {
        self.push(ObservedEvent::Open);
    }

    fn on_tune_ok(&mut self, tuning: &TuneParams) {
        self.push(ObservedEvent::TuneOk(*tuning));
    }

    fn on_blocked(&mut self, reason: &str) {
        self.push(ObservedEvent::Blocked(reason.to_string()));
    }

    fn on_unblocked(&mut self) {
        self.push(ObservedEvent::Unblocked);
    }

    fn on_frame(&mut self, frame: &ConnectionFrame) {
        self.push(ObservedEvent::Frame(frame.name().to_string()));
    }
}

/// Fans events out to several observers.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn ConnectionObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl ConnectionObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }
}

impl ConnectionObserver for ObserverSet {
    fn on_open(&mut self, server_properties: &BTreeMap<String, String>) {
        self.observers.iter_mut().for_each(|o| o.on_open(server_properties));
    }

    fn on_tune_ok(&mut self, tuning: &TuneParams) {
        self.observers.iter_mut().for_each(|o| o.on_tune_ok(tuning));
    }

    fn on_blocked(&mut self, reason: &str) {
        self.observers.iter_mut().for_each(|o| o.on_blocked(reason));
    }

    fn on_unblocked(&mut self) {
        self.observers.iter_mut().for_each(|o| o.on_unblocked());
    }

    fn on_frame(&mut self, frame: &ConnectionFrame) {
        self.observers.iter_mut().for_each(|o| o.on_frame(frame));
    }
}
