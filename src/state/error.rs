use super::event::ConnectionEvent;
use super::model::ConnectionState;
use thiserror::Error;

pub type StateResult<T> = std::result::Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid connection transition: from {from:?} using event {event:?}")]
    InvalidStateTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },
}
