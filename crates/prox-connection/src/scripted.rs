//! In-memory transport replaying a fixed script of server frames.

use crate::frame::{ConnectionFrame, TuneParams};
use crate::transport::Transport;
use parking_lot::Mutex;
use prox_common::{HarnessError, HarnessResult};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Step {
    Frame(ConnectionFrame),
    /// An idle interval with nothing received
    Tick,
    /// Connection reset
    Fail,
}

/// Clones share the script and the record of sent frames.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Step>>>,
    sent: Arc<Mutex<Vec<ConnectionFrame>>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sent(&self) -> Vec<ConnectionFrame> {
        self.sent.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, frame: &ConnectionFrame) -> HarnessResult<()> {
        self.sent.lock().push(frame.clone());
        Ok(())
    }

    fn receive(&mut self) -> HarnessResult<Option<ConnectionFrame>> {
        match self.script.lock().pop_front() {
            Some(Step::Frame(frame)) => Ok(Some(frame)),
            Some(Step::Tick) => Ok(None),
            Some(Step::Fail) => Err(HarnessError::transport("scripted", "connection reset by peer")),
            None => Err(HarnessError::transport("scripted", "connection closed by peer")),
        }
    }

    fn set_idle_timeout(&mut self, _timeout: Duration) -> HarnessResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}

/// Server side of a successful handshake, proposing `heartbeat` seconds.
pub fn server_handshake(heartbeat: u16) -> Vec<Step> {
    let mut server_properties = BTreeMap::new();
    server_properties.insert("product".to_string(), "amqpprox".to_string());
    vec![
        Step::Frame(ConnectionFrame::Start {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: "PLAIN AMQPLAIN".to_string(),
            locales: "en_US".to_string(),
        }),
        Step::Frame(ConnectionFrame::Tune(TuneParams {
            channel_max: 2047,
            frame_max: 131072,
            heartbeat,
        })),
        Step::Frame(ConnectionFrame::OpenOk),
    ]
}
