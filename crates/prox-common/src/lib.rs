//! # Prox Common
//!
//! Common types, errors, and the event sink shared across the harness crates.
//!
//! Every component of the harness reports failures through [`HarnessError`]
//! and reports lifecycle events through an injected [`EventSink`] rather than
//! a process-wide logger.

pub mod errors;
pub mod net;
pub mod sink;
pub mod types;

// Re-export commonly used items
pub use errors::{HarnessError, HarnessResult};
pub use net::connect_within;
pub use sink::{EventLevel, EventSink, RecordedEvent, RecordingSink, SharedSink, TracingSink};
pub use types::{LoadTestParameters, ProcessExit, ProcessSpec, ProxyEndpoint};
