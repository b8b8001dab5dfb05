use thiserror::Error;

use crate::protocol::OutboundMessage;
use crate::scene::{Scene, SceneId, TokenId};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {route} was rejected with status {status}")]
    Rejected { route: String, status: u16 },
    #[error("request to {route} failed: {message}")]
    Transport { route: String, message: String },
    #[error("response from {route} could not be decoded: {source}")]
    Decode {
        route: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from {route} is not a well-formed scene")]
    InvalidScene { route: String },
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] crate::protocol::ProtocolError),
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Request/response side of the session: snapshot refetch and token PATCH.
pub trait SceneApi {
    /// `Ok(None)` means no scene is active.
    fn fetch_active_scene(&self) -> ApiResult<Option<Scene>>;

    /// Sends `body`, a JSON object of changed fields only.
    fn patch_token(
        &self,
        scene_id: &SceneId,
        token_id: &TokenId,
        body: serde_json::Value,
    ) -> ApiResult<()>;
}

/// Outbound half of the push channel.
pub trait ChannelSink {
    fn emit(&self, message: &OutboundMessage) -> ChannelResult<()>;
}
