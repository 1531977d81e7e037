use chrono::{DateTime, Utc};
use prox_common::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_HISTORY: usize = 100;

/// Primary connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport yet
    Disconnected,
    /// Transport open, handshake in progress
    Connecting,
    /// Handshake complete
    Open,
    /// Closed by either side
    Closed,
    /// Transport or protocol failure
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Open => 2,
            ConnectionState::Closed | ConnectionState::Failed => 3,
        }
    }
}

/// Flow-control flag, independent of the primary state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    pub blocked: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: ConnectionState,
    pub to_state: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Forward-only connection state machine with a bounded transition history.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    connection_id: String,
    current_state: ConnectionState,
    flow: FlowState,
    state_history: Vec<StateTransition>,
}

impl ConnectionStateMachine {
    pub fn new(connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            current_state: ConnectionState::Disconnected,
            flow: FlowState::default(),
            state_history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.current_state
    }

    pub fn flow(&self) -> &FlowState {
        &self.flow
    }

    pub fn state_history(&self) -> &[StateTransition] {
        &self.state_history
    }

    /// Transitions only move forward, and terminal states accept nothing.
    pub fn is_valid_transition(&self, target_state: ConnectionState) -> bool {
        if self.current_state.is_terminal() {
            return false;
        }
        match target_state {
            ConnectionState::Closed | ConnectionState::Failed => true,
            target => target.rank() == self.current_state.rank() + 1,
        }
    }

    pub fn transition_to(&mut self, target_state: ConnectionState, reason: Option<String>) -> HarnessResult<()> {
        if !self.is_valid_transition(target_state) {
            return Err(HarnessError::invalid_state(
                &self.connection_id,
                target_state.to_string(),
                self.current_state.to_string(),
            ));
        }

        let now = Utc::now();
        let from_state = self.current_state;
        self.state_history.push(StateTransition {
            from_state,
            to_state: target_state,
            timestamp: now,
            reason,
        });
        if self.state_history.len() > MAX_HISTORY {
            self.state_history.remove(0);
        }
        self.current_state = target_state;

        tracing::debug!(
            "Connection {} transitioned from {} to {}",
            self.connection_id,
            from_state,
            target_state
        );
        Ok(())
    }

    pub fn transition_to_failed(&mut self, reason: String) -> HarnessResult<()> {
        self.transition_to(ConnectionState::Failed, Some(reason))
    }

    pub fn set_blocked(&mut self, reason: &str) {
        self.flow = FlowState {
            blocked: true,
            reason: Some(reason.to_string()),
        };
    }

    pub fn set_unblocked(&mut self) {
        self.flow = FlowState::default();
    }

    pub fn count_transitions_to(&self, state: ConnectionState) -> usize {
        self.state_history.iter().filter(|t| t.to_state == state).count()
    }
}
