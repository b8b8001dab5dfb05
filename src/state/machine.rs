use super::error::{StateError, StateResult};
use super::{ConnectionEvent, ConnectionState};

#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn can_transition(&self, event: ConnectionEvent) -> bool {
        self.next_state(event).is_some()
    }

    pub fn next_state(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent::*;
        match (self.state, event) {
            (_, Connected) => Some(ConnectionState::Resyncing),
            (ConnectionState::Live | ConnectionState::Resyncing, RefreshRequested) => {
                Some(ConnectionState::Resyncing)
            }
            (ConnectionState::Resyncing, SnapshotApplied) => Some(ConnectionState::Live),
            (ConnectionState::Resyncing, SnapshotFailed) => Some(ConnectionState::Resyncing),
            (ConnectionState::Live | ConnectionState::Resyncing, Disconnected) => {
                Some(ConnectionState::Offline)
            }
            _ => None,
        }
    }

    pub fn transition(&mut self, event: ConnectionEvent) -> StateResult<ConnectionState> {
        tracing::debug!(from = ?self.state, event = ?event, "request connection transition");
        let next = self.next_state(event).ok_or_else(|| {
            let from = self.state;
            tracing::warn!(from = ?from, event = ?event, "invalid connection transition requested");
            StateError::InvalidStateTransition { from, event }
        })?;

        tracing::debug!(from = ?self.state, to = ?next, "connection transition applied");
        self.state = next;
        Ok(next)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionState::{:?}", self.state)
    }
}
