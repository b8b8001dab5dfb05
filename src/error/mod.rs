use crate::config::ConfigPathError;
use crate::loader::{FetchError, LoadError, UrlError};
use crate::protocol::ProtocolError;
use crate::state::StateError;
use crate::sync::{ApiError, ChannelError, SyncError};
use thiserror::Error;

pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Config(#[from] ConfigPathError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("failed to read replay input: {0}")]
    Io(#[from] std::io::Error),
}
