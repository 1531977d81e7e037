//! Structured event sink.
//!
//! Components receive a [`SharedSink`] at construction time and report every
//! lifecycle and protocol event through it as `(level, event, detail)`.
//! [`TracingSink`] forwards to `tracing`; [`RecordingSink`] keeps the events in
//! memory so tests can assert on them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Severity of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLevel::Debug => write!(f, "debug"),
            EventLevel::Info => write!(f, "info"),
            EventLevel::Warn => write!(f, "warn"),
            EventLevel::Error => write!(f, "error"),
        }
    }
}

/// Receiver of harness events.
pub trait EventSink: Send + Sync {
    fn emit(&self, level: EventLevel, event: &str, detail: &str);

    fn debug(&self, event: &str, detail: &str) {
        self.emit(EventLevel::Debug, event, detail);
    }

    fn info(&self, event: &str, detail: &str) {
        self.emit(EventLevel::Info, event, detail);
    }

    fn warn(&self, event: &str, detail: &str) {
        self.emit(EventLevel::Warn, event, detail);
    }

    fn error(&self, event: &str, detail: &str) {
        self.emit(EventLevel::Error, event, detail);
    }
}

/// Shared handle to a sink, cloned into every component.
pub type SharedSink = Arc<dyn EventSink>;

/// Forwards events to the `tracing` subscriber installed by the binary.
#[derive(Debug, Clone)]
pub struct TracingSink {
    component: String,
}

impl TracingSink {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn shared(component: impl Into<String>) -> SharedSink {
        Arc::new(Self::new(component))
    }
}

impl EventSink for TracingSink {
    fn emit(&self, level: EventLevel, event: &str, detail: &str) {
        let component = self.component.as_str();
        match level {
            EventLevel::Debug => debug!(component = component, event = event, "{}", detail),
            EventLevel::Info => info!(component = component, event = event, "{}", detail),
            EventLevel::Warn => warn!(component = component, event = event, "{}", detail),
            EventLevel::Error => error!(component = component, event = event, "{}", detail),
        }
    }
}

/// One event captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub level: EventLevel,
    pub event: String,
    pub detail: String,
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Event names in emission order.
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event.clone()).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.count(event) > 0
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, level: EventLevel, event: &str, detail: &str) {
        self.events.lock().push(RecordedEvent {
            level,
            event: event.to_string(),
            detail: detail.to_string(),
        });
    }
}
