//! Shared scene data model. Positions are always image-space pixels.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::geometry::ImagePoint;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(SceneId);
string_id!(TokenId);
string_id!(MarkerId);
string_id!(MediaId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReference {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: TokenId,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    #[serde(default = "default_token_color")]
    pub color: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub is_visible_for_players: bool,
    #[serde(default)]
    pub is_movable_by_players: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<TokenReference>,
}

fn default_token_color() -> String {
    "red".to_string()
}

impl Token {
    pub fn position(&self) -> ImagePoint {
        ImagePoint::new(self.x, self.y)
    }

    pub fn is_well_formed(&self) -> bool {
        !self.id.is_blank()
            && self.x.is_finite()
            && self.y.is_finite()
            && self.radius.is_finite()
            && self.radius >= 0.0
    }
}

/// Partial token update. Absent fields are left untouched when merged; the id
/// is never part of a serialized PATCH body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPatch {
    #[serde(skip_serializing)]
    pub id: TokenId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_visible_for_players: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_movable_by_players: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<TokenReference>,
}

impl TokenPatch {
    pub fn new(id: TokenId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn position(id: TokenId, position: ImagePoint) -> Self {
        Self {
            x: Some(position.x),
            y: Some(position.y),
            ..Self::new(id)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.radius.is_none()
            && self.color.is_none()
            && self.label.is_none()
            && self.is_visible_for_players.is_none()
            && self.is_movable_by_players.is_none()
            && self.is_locked.is_none()
            && self.reference.is_none()
    }

    pub fn is_well_formed(&self) -> bool {
        let finite = |value: Option<f64>| value.is_none_or(f64::is_finite);
        !self.id.is_blank()
            && finite(self.x)
            && finite(self.y)
            && finite(self.radius)
            && self.radius.is_none_or(|radius| radius >= 0.0)
    }

    /// Layers `newer` on top of `self`; fields set in `newer` win.
    pub fn absorb(&mut self, newer: TokenPatch) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if newer.$field.is_some() { self.$field = newer.$field; })*
            };
        }
        take!(
            x,
            y,
            radius,
            color,
            label,
            is_visible_for_players,
            is_movable_by_players,
            is_locked,
            reference
        );
    }

    /// Writes the set fields into `token`. Returns whether anything changed.
    pub fn merge_into(&self, token: &mut Token) -> bool {
        let mut changed = false;
        macro_rules! merge {
            ($($field:ident),*) => {
                $(if let Some(value) = &self.$field {
                    if token.$field != *value {
                        token.$field = value.clone();
                        changed = true;
                    }
                })*
            };
        }
        merge!(
            x,
            y,
            radius,
            color,
            label,
            is_visible_for_players,
            is_movable_by_players,
            is_locked
        );
        if let Some(reference) = &self.reference {
            if token.reference.as_ref() != Some(reference) {
                token.reference = Some(reference.clone());
                changed = true;
            }
        }
        changed
    }

    /// Drops the fields that `other` sets to the same value.
    pub fn without_matching(&self, other: &TokenPatch) -> TokenPatch {
        let mut rest = self.clone();
        macro_rules! clear {
            ($($field:ident),*) => {
                $(if other.$field.is_some() && other.$field == self.$field { rest.$field = None; })*
            };
        }
        clear!(
            x,
            y,
            radius,
            color,
            label,
            is_visible_for_players,
            is_movable_by_players,
            is_locked,
            reference
        );
        rest
    }

    /// The subset of set fields whose value differs from `token`.
    pub fn unsatisfied_by(&self, token: &Token) -> TokenPatch {
        let mut rest = self.clone();
        macro_rules! clear {
            ($($field:ident),*) => {
                $(if self.$field.as_ref() == Some(&token.$field) { rest.$field = None; })*
            };
        }
        clear!(
            x,
            y,
            radius,
            color,
            label,
            is_visible_for_players,
            is_movable_by_players,
            is_locked
        );
        if self.reference.is_some() && self.reference == token.reference {
            rest.reference = None;
        }
        rest
    }

    /// Drops the fields that `other` sets, keeping the rest.
    pub fn without_fields_of(&self, other: &TokenPatch) -> TokenPatch {
        let mut rest = self.clone();
        macro_rules! clear {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { rest.$field = None; })*
            };
        }
        clear!(
            x,
            y,
            radius,
            color,
            label,
            is_visible_for_players,
            is_movable_by_players,
            is_locked,
            reference
        );
        rest
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grid {
    pub x: f64,
    pub y: f64,
    pub side_length: f64,
    #[serde(default = "default_grid_color")]
    pub color: String,
}

impl Grid {
    pub fn is_well_formed(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.side_length.is_finite()
            && self.side_length > 0.0
    }
}

fn default_grid_color() -> String {
    "red".to_string()
}

/// Authoritative scene as announced over the channel or fetched on resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: SceneId,
    #[serde(default)]
    pub image_resource_version: u64,
    #[serde(default)]
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub grid: Option<Grid>,
    #[serde(default)]
    pub show_grid_to_players: bool,
}

impl Scene {
    pub fn new(id: impl Into<SceneId>) -> Self {
        Self {
            id: id.into(),
            image_resource_version: 0,
            tokens: Vec::new(),
            grid: None,
            show_grid_to_players: false,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        !self.id.is_blank()
            && self.tokens.iter().all(Token::is_well_formed)
            && self.grid.as_ref().map_or(true, Grid::is_well_formed)
    }
}

/// Transient "look here" ping. Expires client-side.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub id: MarkerId,
    pub x: f64,
    pub y: f64,
    pub created_at: Instant,
}

impl Marker {
    pub fn position(&self) -> ImagePoint {
        ImagePoint::new(self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(id: &str) -> Token {
        Token {
            id: TokenId::from(id),
            x: 10.0,
            y: 20.0,
            radius: 5.0,
            color: "blue".to_string(),
            label: "A".to_string(),
            is_visible_for_players: true,
            is_movable_by_players: false,
            is_locked: false,
            reference: None,
        }
    }

    #[test]
    fn merge_keeps_fields_the_patch_omits() {
        let mut target = token("t1");
        let patch = TokenPatch {
            label: Some("Goblin".to_string()),
            ..TokenPatch::new(TokenId::from("t1"))
        };
        assert!(patch.merge_into(&mut target));
        assert_eq!(target.label, "Goblin");
        assert_eq!(target.color, "blue");
        assert_eq!(target.x, 10.0);

        assert!(!patch.merge_into(&mut target));
        assert!(patch.unsatisfied_by(&target).is_empty());
    }

    #[test]
    fn patch_body_serializes_changed_fields_only() {
        let patch = TokenPatch::position(TokenId::from("t1"), ImagePoint::new(1.5, 2.0));
        let body = serde_json::to_value(&patch).expect("patch should serialize");
        assert_eq!(body, serde_json::json!({ "x": 1.5, "y": 2.0 }));
    }

    #[test]
    fn absorb_prefers_newer_fields() {
        let mut older = TokenPatch::position(TokenId::from("t1"), ImagePoint::new(1.0, 1.0));
        older.label = Some("old".to_string());
        older.absorb(TokenPatch::position(TokenId::from("t1"), ImagePoint::new(3.0, 4.0)));
        assert_eq!(older.x, Some(3.0));
        assert_eq!(older.y, Some(4.0));
        assert_eq!(older.label.as_deref(), Some("old"));
    }

    #[test]
    fn without_fields_of_drops_overlapping_fields() {
        let mut pending = TokenPatch::position(TokenId::from("t1"), ImagePoint::new(1.0, 1.0));
        pending.label = Some("x".to_string());
        let inbound = TokenPatch {
            label: Some("server".to_string()),
            radius: Some(3.0),
            ..TokenPatch::new(TokenId::from("t1"))
        };
        let rest = inbound.without_fields_of(&pending);
        assert_eq!(rest.label, None);
        assert_eq!(rest.radius, Some(3.0));
    }

    #[test]
    fn matching_helpers_keep_only_differing_fields() {
        let mut expected = TokenPatch::position(TokenId::from("t1"), ImagePoint::new(10.0, 99.0));
        expected.label = Some("A".to_string());

        let remaining = expected.unsatisfied_by(&token("t1"));
        assert_eq!(remaining.x, None);
        assert_eq!(remaining.y, Some(99.0));
        assert_eq!(remaining.label, None);

        let echo = TokenPatch::position(TokenId::from("t1"), ImagePoint::new(10.0, 5.0));
        let left = expected.without_matching(&echo);
        assert_eq!(left.x, None);
        assert_eq!(left.y, Some(99.0));
        assert_eq!(left.label.as_deref(), Some("A"));
    }

    #[test]
    fn scene_deserializes_camel_case_with_defaults() {
        let scene: Scene = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "tokens": [{
                "id": "t1", "x": 1.0, "y": 2.0, "radius": 3.0,
                "isVisibleForPlayers": true,
                "reference": { "type": "note", "id": "n1" }
            }],
            "grid": { "x": 0.0, "y": 0.0, "sideLength": 50.0 }
        }))
        .expect("scene should parse");

        assert_eq!(scene.id.as_str(), "m1");
        assert_eq!(scene.image_resource_version, 0);
        assert!(scene.tokens[0].is_visible_for_players);
        assert_eq!(scene.tokens[0].color, "red");
        assert_eq!(scene.tokens[0].reference.as_ref().map(|r| r.kind.as_str()), Some("note"));
        assert_eq!(scene.grid.as_ref().map(|grid| grid.color.as_str()), Some("red"));
        assert!(scene.is_well_formed());
    }

    #[test]
    fn scene_with_degenerate_grid_is_not_well_formed() {
        let mut scene = Scene::new("m1");
        scene.grid = Some(Grid {
            x: 0.0,
            y: -1e17,
            side_length: 0.0,
            color: "red".to_string(),
        });
        assert!(!scene.is_well_formed());

        scene.grid = Some(Grid {
            x: 12.0,
            y: -1e17,
            side_length: 40.0,
            color: "red".to_string(),
        });
        assert!(scene.is_well_formed());
    }

    #[test]
    fn non_finite_positions_are_not_well_formed() {
        let mut bad = token("t1");
        bad.x = f64::NAN;
        assert!(!bad.is_well_formed());

        let patch = TokenPatch {
            y: Some(f64::INFINITY),
            ..TokenPatch::new(TokenId::from("t1"))
        };
        assert!(!patch.is_well_formed());
    }
}
