//! AMQP 0-9-1 client connection lifecycle.
//!
//! Just enough of the protocol to open a connection through a proxy, watch
//! flow-control notifications and close again, with every terminal condition
//! reported to the caller.

pub mod frame;
pub mod lifecycle;
pub mod observer;
pub mod state;
pub mod transport;

#[cfg(test)]
mod scripted;

pub use frame::{decode, encode, ConnectionFrame, TuneParams, PROTOCOL_HEADER};
pub use lifecycle::{
    negotiate_tuning, CloseReason, ConnectionConfig, ConnectionLifecycle, ReceivePolicy, DEFAULT_PORT,
};
pub use observer::{ConnectionObserver, LoggingObserver, ObservedEvent, ObserverSet, RecordingObserver};
pub use state::{ConnectionState, ConnectionStateMachine, FlowState, StateTransition};
pub use transport::{TcpTransport, Transport};
