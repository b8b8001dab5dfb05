//! Channel wire messages.
//!
//! Every message is `{"type": "<kind>", "payload": {...}}` with camelCase
//! payload keys. Parsing validates the payload so that nothing malformed
//! reaches the store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::ImagePoint;
use crate::scene::{MarkerId, MediaId, Scene, SceneId, Token, TokenId, TokenPatch};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed channel message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: &'static str },
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSwitched {
    #[serde(default)]
    pub scene: Option<Scene>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FogUpdated {
    pub scene_id: SceneId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAdded {
    pub scene_id: SceneId,
    pub token: Token,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUpdated {
    pub scene_id: SceneId,
    pub token: TokenPatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRemoved {
    pub scene_id: SceneId,
    pub token_id: TokenId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAreaEcho {
    pub id: MarkerId,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaShared {
    pub id: MediaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum InboundMessage {
    SceneSwitched(SceneSwitched),
    FogUpdated(FogUpdated),
    TokenAdded(TokenAdded),
    TokenUpdated(TokenUpdated),
    TokenRemoved(TokenRemoved),
    MarkArea(MarkAreaEcho),
    MediaShared(MediaShared),
}

impl InboundMessage {
    /// Decodes and validates one channel frame.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(raw)?;
        message.validate()?;
        Ok(message)
    }

    pub fn from_value(value: serde_json::Value) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_value(value)?;
        message.validate()?;
        Ok(message)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SceneSwitched(_) => "scene-switched",
            Self::FogUpdated(_) => "fog-updated",
            Self::TokenAdded(_) => "token-added",
            Self::TokenUpdated(_) => "token-updated",
            Self::TokenRemoved(_) => "token-removed",
            Self::MarkArea(_) => "mark-area",
            Self::MediaShared(_) => "media-shared",
        }
    }

    fn validate(&self) -> ProtocolResult<()> {
        let kind = self.kind();
        let invalid = |reason: &'static str| -> ProtocolResult<()> {
            Err(ProtocolError::InvalidPayload { kind, reason })
        };
        match self {
            Self::SceneSwitched(SceneSwitched { scene: Some(scene) }) if !scene.is_well_formed() => {
                invalid("scene has a blank id, a malformed token or a degenerate grid")
            }
            Self::SceneSwitched(_) => Ok(()),
            Self::FogUpdated(payload) if payload.scene_id.is_blank() => invalid("blank scene id"),
            Self::TokenAdded(payload) if payload.scene_id.is_blank() => invalid("blank scene id"),
            Self::TokenAdded(payload) if !payload.token.is_well_formed() => {
                invalid("token has a blank id or non-finite geometry")
            }
            Self::TokenUpdated(payload) if payload.scene_id.is_blank() => invalid("blank scene id"),
            Self::TokenUpdated(payload) if !payload.token.is_well_formed() => {
                invalid("token patch has a blank id or non-finite geometry")
            }
            Self::TokenRemoved(payload)
                if payload.scene_id.is_blank() || payload.token_id.is_blank() =>
            {
                invalid("blank scene or token id")
            }
            Self::MarkArea(payload) if payload.id.is_blank() => invalid("blank marker id"),
            Self::MarkArea(payload) if !(payload.x.is_finite() && payload.y.is_finite()) => {
                invalid("non-finite marker position")
            }
            Self::MediaShared(payload) if payload.id.is_blank() => invalid("blank media id"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkAreaRequest {
    pub x: f64,
    pub y: f64,
}

impl From<ImagePoint> for MarkAreaRequest {
    fn from(point: ImagePoint) -> Self {
        Self {
            x: point.x,
            y: point.y,
        }
    }
}

/// Messages this client publishes. The server echoes `mark-area` back to
/// every participant, sender included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum OutboundMessage {
    MarkArea(MarkAreaRequest),
}

impl OutboundMessage {
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
