//! Local pan/zoom state and the gesture controller that owns it.

pub mod gesture;

use crate::geometry::{Dimensions, ImagePoint};
use crate::scene::TokenId;

pub use gesture::{
    GestureController, GestureIntent, GesturePhase, GestureSettings, PointerEvent, PointerId,
    WheelEvent,
};

pub const VIEWPORT_MIN_SCALE: f64 = 0.1;
pub const VIEWPORT_MAX_SCALE: f64 = 64.0;
const VIEWPORT_TRANSLATE_LIMIT: f64 = 1.0e6;

/// Scale + translate applied to the image plane. Never shared, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportTransform {
    pub scale: f64,
    pub translate_x: f64,
    pub translate_y: f64,
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl ViewportTransform {
    pub const fn identity() -> Self {
        Self {
            scale: 1.0,
            translate_x: 0.0,
            translate_y: 0.0,
        }
    }

    pub const fn new(scale: f64, translate_x: f64, translate_y: f64) -> Self {
        Self {
            scale,
            translate_x,
            translate_y,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Returns a transform whose values are finite and inside bounds. Non-finite
    /// components fall back to `fallback`.
    pub(crate) fn sanitized(self, min_scale: f64, fallback: ViewportTransform) -> Self {
        let scale = if self.scale.is_finite() {
            self.scale.clamp(min_scale, VIEWPORT_MAX_SCALE)
        } else {
            fallback.scale.clamp(min_scale, VIEWPORT_MAX_SCALE)
        };
        let translate_x = finite_or(self.translate_x, fallback.translate_x)
            .clamp(-VIEWPORT_TRANSLATE_LIMIT, VIEWPORT_TRANSLATE_LIMIT);
        let translate_y = finite_or(self.translate_y, fallback.translate_y)
            .clamp(-VIEWPORT_TRANSLATE_LIMIT, VIEWPORT_TRANSLATE_LIMIT);
        Self {
            scale,
            translate_x,
            translate_y,
        }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else if fallback.is_finite() {
        fallback
    } else {
        0.0
    }
}

/// Visible render area in render units and the device pixels per unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMetrics {
    pub width: f64,
    pub height: f64,
    pub factor: f64,
}

impl ViewportMetrics {
    pub const fn new(width: f64, height: f64, factor: f64) -> Self {
        Self {
            width,
            height,
            factor,
        }
    }

    pub fn pixel_size(&self) -> Dimensions {
        Dimensions::new(self.width * self.factor, self.height * self.factor)
    }

    pub fn is_usable(&self) -> bool {
        Dimensions::new(self.width, self.height).is_drawable()
            && self.factor.is_finite()
            && self.factor > 0.0
    }
}

/// Token currently under the pointer, reported by the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct HoveredToken {
    pub id: TokenId,
    pub position: ImagePoint,
}

/// Side channel between per-token renderer callbacks and the gesture
/// controller. A registered hover target suppresses viewport panning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoverContext {
    target: Option<HoveredToken>,
}

impl HoverContext {
    pub const fn new() -> Self {
        Self { target: None }
    }

    pub fn enter(&mut self, id: TokenId, position: ImagePoint) {
        self.target = Some(HoveredToken { id, position });
    }

    /// Clears the target only if `id` still owns it.
    pub fn leave(&mut self, id: &TokenId) {
        if self.target.as_ref().is_some_and(|target| &target.id == id) {
            self.target = None;
        }
    }

    pub fn clear(&mut self) {
        self.target = None;
    }

    pub fn target(&self) -> Option<&HoveredToken> {
        self.target.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_transform_defaults_to_identity() {
        let transform = ViewportTransform::default();
        assert!(transform.is_identity());
        assert_eq!(transform.scale, 1.0);
    }

    #[test]
    fn sanitized_clamps_scale_and_replaces_non_finite_values() {
        let fallback = ViewportTransform::new(1.5, 2.0, -3.0);
        let sanitized = ViewportTransform::new(f64::NAN, f64::INFINITY, 4.0)
            .sanitized(VIEWPORT_MIN_SCALE, fallback);
        assert_eq!(sanitized, ViewportTransform::new(1.5, 2.0, 4.0));

        let tiny = ViewportTransform::new(-2.0, 0.0, 0.0).sanitized(VIEWPORT_MIN_SCALE, fallback);
        assert_eq!(tiny.scale, VIEWPORT_MIN_SCALE);
    }

    #[test]
    fn hover_leave_only_clears_matching_token() {
        let mut hover = HoverContext::new();
        hover.enter(TokenId::from("a"), ImagePoint::new(1.0, 2.0));
        hover.leave(&TokenId::from("b"));
        assert!(hover.target().is_some());

        hover.leave(&TokenId::from("a"));
        assert!(hover.target().is_none());
    }

    #[test]
    fn metrics_report_pixel_size() {
        let metrics = ViewportMetrics::new(16.0, 9.0, 2.0);
        assert_eq!(metrics.pixel_size(), Dimensions::new(32.0, 18.0));
        assert!(metrics.is_usable());
        assert!(!ViewportMetrics::new(16.0, 9.0, 0.0).is_usable());
    }
}
