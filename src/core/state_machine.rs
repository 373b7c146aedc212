//! Connector State Machine
//!
//! Formal lifecycle for a single connector. Transitions are validated and
//! recorded so that failures can be reconstructed after the fact.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Created, `open()` not called yet
    Unopened,
    /// Transport handshake in progress
    Negotiating,
    /// Channel handed out and usable
    Open,
    /// Teardown in progress
    Closing,
    /// Torn down; terminal
    Closed,
    /// Handshake or I/O failed; only `close()` is allowed
    Failed,
}

impl ConnectionState {
    /// Check if state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check if state is a transitional state
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Closing)
    }

    /// Check if the channel may be used
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unopened => "unopened",
            Self::Negotiating => "negotiating",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: ConnectionState,
    /// New state
    pub to: ConnectionState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State at the time of the attempt
    pub from: ConnectionState,
    /// Requested state
    pub to: ConnectionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Connector state machine
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    history: VecDeque<StateTransition>,
    max_history: usize,
    last_transition: Option<Instant>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a new state machine in `Unopened`
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Unopened,
            history: VecDeque::new(),
            max_history: 32,
            last_transition: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Recorded transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    /// Get time in current state
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Transition to a new state
    pub fn transition(
        &mut self,
        new_state: ConnectionState,
        reason: Option<&str>,
    ) -> Result<(), InvalidTransition> {
        if !Self::is_valid_transition(self.state, new_state) {
            return Err(InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.history.push_back(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > self.max_history {
            self.history.pop_front();
        }

        tracing::trace!(from = %self.state, to = %new_state, ?reason, "connector transition");
        self.state = new_state;
        self.last_transition = Some(Instant::now());
        Ok(())
    }

    fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (from, to),
            (Unopened, Negotiating)
                // validation failure never reaches the driver
                | (Unopened, Failed)
                | (Unopened, Closing)
                | (Negotiating, Open)
                | (Negotiating, Failed)
                | (Open, Closing)
                | (Open, Failed)
                | (Failed, Closing)
                | (Closing, Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_transitions() {
        let mut sm = ConnectionStateMachine::new();
        assert_eq!(sm.state(), ConnectionState::Unopened);

        sm.transition(ConnectionState::Negotiating, Some("open"))
            .unwrap();
        sm.transition(ConnectionState::Open, None).unwrap();
        assert!(sm.state().is_open());

        sm.transition(ConnectionState::Closing, None).unwrap();
        sm.transition(ConnectionState::Closed, None).unwrap();
        assert!(sm.state().is_terminal());
        assert_eq!(sm.history().count(), 4);
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = ConnectionStateMachine::new();

        // Can't go directly from Unopened to Open
        let err = sm.transition(ConnectionState::Open, None).unwrap_err();
        assert_eq!(err.from, ConnectionState::Unopened);
        assert_eq!(sm.state(), ConnectionState::Unopened);
    }

    #[test]
    fn test_closed_is_final() {
        let mut sm = ConnectionStateMachine::new();
        sm.transition(ConnectionState::Closing, None).unwrap();
        sm.transition(ConnectionState::Closed, None).unwrap();

        for next in [
            ConnectionState::Negotiating,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Failed,
            ConnectionState::Closed,
        ] {
            assert!(sm.transition(next, None).is_err());
        }
    }

    #[test]
    fn test_failed_only_closes() {
        let mut sm = ConnectionStateMachine::new();
        sm.transition(ConnectionState::Negotiating, None).unwrap();
        sm.transition(ConnectionState::Failed, Some("handshake"))
            .unwrap();

        assert!(sm.transition(ConnectionState::Open, None).is_err());
        assert!(sm.transition(ConnectionState::Negotiating, None).is_err());
        sm.transition(ConnectionState::Closing, None).unwrap();
        sm.transition(ConnectionState::Closed, None).unwrap();

        let last = sm.history().last().unwrap();
        assert_eq!(last.from, ConnectionState::Closing);
    }
}
