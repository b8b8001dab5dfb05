//! Pointer and wheel gesture handling for the local viewport.
//!
//! The controller owns the only mutable [`ViewportTransform`]. Each gesture
//! keeps a small session record created when it starts and dropped when it
//! ends; nothing carries over between gestures except the transform itself.
//! Time is always passed in by the caller so timers fire from [`tick`].
//!
//! [`tick`]: GestureController::tick

use std::time::{Duration, Instant};

use crate::geometry::{ImagePoint, ScreenPoint};
use crate::scene::TokenId;
use crate::timer::{TimerHandle, TimerQueue};
use crate::transform::{screen_to_image, screen_to_world, RenderGeometry};

use super::{HoverContext, ViewportMetrics, ViewportTransform, VIEWPORT_MAX_SCALE};

const MIN_PINCH_DISTANCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Down { id: PointerId, at: ScreenPoint },
    Move { id: PointerId, at: ScreenPoint },
    Up { id: PointerId, at: ScreenPoint },
    Cancel { id: PointerId },
}

impl PointerEvent {
    pub fn id(&self) -> PointerId {
        match *self {
            Self::Down { id, .. } | Self::Move { id, .. } | Self::Up { id, .. } => id,
            Self::Cancel { id } => id,
        }
    }
}

/// Mouse wheel step. With `ctrl` held it zooms around `at`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelEvent {
    pub at: ScreenPoint,
    pub delta_y: f64,
    pub ctrl: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GestureIntent {
    MarkArea(ImagePoint),
    TokenDragMove { token_id: TokenId, position: ImagePoint },
    TokenDragEnd { token_id: TokenId, position: ImagePoint },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GesturePhase {
    Idle,
    Panning,
    Pinching,
    PressHold,
    TokenDrag,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureSettings {
    pub press_hold: Duration,
    pub min_scale: f64,
    pub wheel_divisor: f64,
    pub wheel_settle: Duration,
    pub drag_cooldown: Duration,
}

impl Default for GestureSettings {
    fn default() -> Self {
        Self {
            press_hold: Duration::from_millis(200),
            min_scale: super::VIEWPORT_MIN_SCALE,
            wheel_divisor: 100.0,
            wheel_settle: Duration::from_millis(150),
            drag_cooldown: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GestureTimer {
    PressHold,
    WheelSettle,
    DragCooldown,
}

#[derive(Debug, Clone, Copy)]
struct PressHoldSession {
    pointer: PointerId,
    at: ScreenPoint,
    timer: TimerHandle,
}

#[derive(Debug, Clone, Copy)]
struct PanSession {
    pointer: PointerId,
    origin: ScreenPoint,
    memo: ViewportTransform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinchSource {
    Pointers(PointerId, PointerId),
    Wheel,
}

#[derive(Debug, Clone, Copy)]
struct PinchSession {
    source: PinchSource,
    origin: ScreenPoint,
    start_distance: f64,
    start_scale: f64,
}

#[derive(Debug, Clone)]
struct TokenDragSession {
    pointer: PointerId,
    token_id: TokenId,
    origin: ScreenPoint,
    memo: ImagePoint,
    position: ImagePoint,
}

#[derive(Debug, Clone, Default)]
enum GestureSession {
    #[default]
    Idle,
    PressHold(PressHoldSession),
    Panning(PanSession),
    Pinching(PinchSession),
    TokenDrag(TokenDragSession),
}

#[derive(Debug)]
pub struct GestureController {
    settings: GestureSettings,
    transform: ViewportTransform,
    metrics: Option<ViewportMetrics>,
    geometry: Option<RenderGeometry>,
    pointers: Vec<(PointerId, ScreenPoint)>,
    session: GestureSession,
    timers: TimerQueue<GestureTimer>,
    drag_blocked: bool,
    torn_down: bool,
}

impl Default for GestureController {
    fn default() -> Self {
        Self::new(GestureSettings::default())
    }
}

impl GestureController {
    pub fn new(mut settings: GestureSettings) -> Self {
        let min_scale = settings.min_scale;
        if !(min_scale.is_finite() && min_scale > 0.0 && min_scale <= VIEWPORT_MAX_SCALE) {
            tracing::warn!(min_scale, "unusable minimum scale; using default");
            settings.min_scale = super::VIEWPORT_MIN_SCALE;
        }
        Self {
            settings,
            transform: ViewportTransform::identity(),
            metrics: None,
            geometry: None,
            pointers: Vec::new(),
            session: GestureSession::Idle,
            timers: TimerQueue::new(),
            drag_blocked: false,
            torn_down: false,
        }
    }

    pub fn transform(&self) -> ViewportTransform {
        self.transform
    }

    pub fn settings(&self) -> &GestureSettings {
        &self.settings
    }

    pub fn phase(&self) -> GesturePhase {
        match self.session {
            GestureSession::Idle => GesturePhase::Idle,
            GestureSession::PressHold(_) => GesturePhase::PressHold,
            GestureSession::Panning(_) => GesturePhase::Panning,
            GestureSession::Pinching(_) => GesturePhase::Pinching,
            GestureSession::TokenDrag(_) => GesturePhase::TokenDrag,
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Unusable metrics disable gestures until valid ones arrive.
    pub fn set_metrics(&mut self, metrics: ViewportMetrics) {
        self.metrics = metrics.is_usable().then_some(metrics);
    }

    pub fn set_geometry(&mut self, geometry: Option<RenderGeometry>) {
        self.geometry = geometry;
    }

    pub fn metrics(&self) -> Option<ViewportMetrics> {
        self.metrics
    }

    pub fn geometry(&self) -> Option<RenderGeometry> {
        self.geometry
    }

    /// Earliest pending timer, for the caller's event loop.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Resets pan and zoom. A pending press-hold still fires and resolves
    /// against the reset transform.
    pub fn center(&mut self) {
        if self.torn_down {
            return;
        }
        self.transform = ViewportTransform::identity();
        if matches!(
            self.session,
            GestureSession::Panning(_) | GestureSession::Pinching(_)
        ) {
            self.end_session();
        }
        tracing::debug!("viewport centered");
    }

    /// Clears every timer and gesture. Later events are ignored.
    pub fn teardown(&mut self) {
        self.timers.clear();
        self.pointers.clear();
        self.session = GestureSession::Idle;
        self.torn_down = true;
        tracing::debug!("gesture controller torn down");
    }

    pub fn handle_pointer(
        &mut self,
        event: PointerEvent,
        hover: &HoverContext,
        now: Instant,
    ) -> Vec<GestureIntent> {
        if self.torn_down || self.metrics.is_none() {
            return Vec::new();
        }
        match event {
            PointerEvent::Down { id, at } => {
                self.pointer_down(id, at, hover, now);
                Vec::new()
            }
            PointerEvent::Move { id, at } => self.pointer_move(id, at),
            PointerEvent::Up { id, at } => {
                self.track(id, at);
                self.pointer_up(id, now)
            }
            PointerEvent::Cancel { id } => {
                self.pointer_cancel(id, now);
                Vec::new()
            }
        }
    }

    pub fn handle_wheel(&mut self, event: WheelEvent, now: Instant) {
        if self.torn_down || !event.ctrl || !event.delta_y.is_finite() {
            return;
        }
        let Some(metrics) = self.metrics else {
            return;
        };
        match self.session {
            GestureSession::Idle => {
                self.session = GestureSession::Pinching(PinchSession {
                    source: PinchSource::Wheel,
                    origin: event.at,
                    start_distance: 0.0,
                    start_scale: self.transform.scale,
                });
            }
            GestureSession::Pinching(PinchSession {
                source: PinchSource::Wheel,
                ..
            }) => {}
            _ => return,
        }
        let target = self.transform.scale - event.delta_y / self.settings.wheel_divisor;
        self.zoom_around(event.at, target, metrics);
        self.timers.cancel_key(&GestureTimer::WheelSettle);
        self.timers
            .arm(GestureTimer::WheelSettle, now + self.settings.wheel_settle);
    }

    /// Fires due timers.
    pub fn tick(&mut self, now: Instant) -> Vec<GestureIntent> {
        if self.torn_down {
            return Vec::new();
        }
        let mut intents = Vec::new();
        for timer in self.timers.fire_due(now) {
            match timer {
                GestureTimer::PressHold => {
                    if let GestureSession::PressHold(press) = self.session {
                        self.session = GestureSession::Idle;
                        if let Some(point) = self.resolve_image_point(press.at) {
                            tracing::debug!(x = point.x, y = point.y, "press-hold fired");
                            intents.push(GestureIntent::MarkArea(point));
                        }
                    }
                }
                GestureTimer::WheelSettle => {
                    if matches!(
                        self.session,
                        GestureSession::Pinching(PinchSession {
                            source: PinchSource::Wheel,
                            ..
                        })
                    ) {
                        self.session = GestureSession::Idle;
                    }
                }
                GestureTimer::DragCooldown => self.drag_blocked = false,
            }
        }
        intents
    }

    fn pointer_down(
        &mut self,
        id: PointerId,
        at: ScreenPoint,
        hover: &HoverContext,
        now: Instant,
    ) {
        self.register(id, at);
        match &self.session {
            GestureSession::Idle if self.pointers.len() == 1 => {
                if let Some(target) = hover.target() {
                    self.session = GestureSession::TokenDrag(TokenDragSession {
                        pointer: id,
                        token_id: target.id.clone(),
                        origin: at,
                        memo: target.position,
                        position: target.position,
                    });
                    return;
                }
                let timer = self
                    .timers
                    .arm(GestureTimer::PressHold, now + self.settings.press_hold);
                self.session = GestureSession::PressHold(PressHoldSession {
                    pointer: id,
                    at,
                    timer,
                });
            }
            GestureSession::Idle | GestureSession::PressHold(_) | GestureSession::Panning(_) => {
                if let Some(other) = self
                    .pointers
                    .iter()
                    .map(|(pointer, _)| *pointer)
                    .find(|pointer| *pointer != id)
                {
                    self.start_pinch(other, id);
                }
            }
            GestureSession::Pinching(_) | GestureSession::TokenDrag(_) => {}
        }
    }

    fn pointer_move(&mut self, id: PointerId, at: ScreenPoint) -> Vec<GestureIntent> {
        if !self.track(id, at) {
            return Vec::new();
        }
        let Some(metrics) = self.metrics else {
            return Vec::new();
        };
        match self.session.clone() {
            // Any move ends the hold, even one reported at the down position.
            GestureSession::PressHold(press) if press.pointer == id => {
                self.timers.cancel(press.timer);
                if self.drag_blocked {
                    self.session = GestureSession::Idle;
                    return Vec::new();
                }
                let pan = PanSession {
                    pointer: id,
                    origin: press.at,
                    memo: self.transform,
                };
                self.session = GestureSession::Panning(pan);
                self.pan_to(pan, at, metrics);
                Vec::new()
            }
            GestureSession::Panning(pan) if pan.pointer == id => {
                self.pan_to(pan, at, metrics);
                Vec::new()
            }
            GestureSession::Pinching(pinch) => {
                if let PinchSource::Pointers(a, b) = pinch.source {
                    if let (Some(first), Some(second)) = (self.position_of(a), self.position_of(b))
                    {
                        let distance = first.distance_to(second);
                        if pinch.start_distance >= MIN_PINCH_DISTANCE {
                            let target = pinch.start_scale * distance / pinch.start_distance;
                            self.zoom_around(pinch.origin, target, metrics);
                        }
                    }
                }
                Vec::new()
            }
            GestureSession::TokenDrag(mut drag) if drag.pointer == id => {
                let Some(geometry) = self.geometry else {
                    return Vec::new();
                };
                let pixels_per_image_unit =
                    metrics.factor * self.transform.scale * geometry.factor;
                if !(pixels_per_image_unit.is_finite() && pixels_per_image_unit > 0.0) {
                    return Vec::new();
                }
                // Screen and image space both grow downward, so no flip here.
                let position = ImagePoint::new(
                    drag.memo.x + (at.x - drag.origin.x) / pixels_per_image_unit,
                    drag.memo.y + (at.y - drag.origin.y) / pixels_per_image_unit,
                );
                drag.position = position;
                let token_id = drag.token_id.clone();
                self.session = GestureSession::TokenDrag(drag);
                vec![GestureIntent::TokenDragMove { token_id, position }]
            }
            _ => Vec::new(),
        }
    }

    fn pointer_up(&mut self, id: PointerId, now: Instant) -> Vec<GestureIntent> {
        let mut intents = Vec::new();
        match self.session.clone() {
            GestureSession::PressHold(press) if press.pointer == id => {
                self.timers.cancel(press.timer);
                self.session = GestureSession::Idle;
            }
            GestureSession::Panning(pan) if pan.pointer == id => {
                self.session = GestureSession::Idle;
            }
            GestureSession::Pinching(PinchSession {
                source: PinchSource::Pointers(a, b),
                ..
            }) if a == id || b == id => {
                self.end_pinch(now);
            }
            GestureSession::TokenDrag(drag) if drag.pointer == id => {
                self.session = GestureSession::Idle;
                if drag.position != drag.memo {
                    intents.push(GestureIntent::TokenDragEnd {
                        token_id: drag.token_id,
                        position: drag.position,
                    });
                }
            }
            _ => {}
        }
        self.untrack(id);
        intents
    }

    fn pointer_cancel(&mut self, id: PointerId, now: Instant) {
        match self.session.clone() {
            GestureSession::PressHold(press) if press.pointer == id => {
                self.timers.cancel(press.timer);
                self.session = GestureSession::Idle;
            }
            GestureSession::Pinching(PinchSession {
                source: PinchSource::Pointers(a, b),
                ..
            }) if a == id || b == id => self.end_pinch(now),
            GestureSession::Panning(PanSession { pointer, .. })
            | GestureSession::TokenDrag(TokenDragSession { pointer, .. })
                if pointer == id =>
            {
                self.session = GestureSession::Idle;
            }
            _ => {}
        }
        self.untrack(id);
    }

    fn start_pinch(&mut self, first: PointerId, second: PointerId) {
        if let GestureSession::PressHold(press) = self.session {
            self.timers.cancel(press.timer);
        }
        let (origin, start_distance) = match (self.position_of(first), self.position_of(second)) {
            (Some(a), Some(b)) => (a.midpoint(b), a.distance_to(b)),
            _ => return,
        };
        self.session = GestureSession::Pinching(PinchSession {
            source: PinchSource::Pointers(first, second),
            origin,
            start_distance,
            start_scale: self.transform.scale,
        });
        tracing::debug!(start_distance, "pinch started");
    }

    fn end_pinch(&mut self, now: Instant) {
        self.session = GestureSession::Idle;
        self.drag_blocked = true;
        self.timers.cancel_key(&GestureTimer::DragCooldown);
        self.timers
            .arm(GestureTimer::DragCooldown, now + self.settings.drag_cooldown);
    }

    fn end_session(&mut self) {
        if let GestureSession::PressHold(press) = self.session {
            self.timers.cancel(press.timer);
        }
        self.timers.cancel_key(&GestureTimer::WheelSettle);
        self.session = GestureSession::Idle;
    }

    fn pan_to(&mut self, pan: PanSession, at: ScreenPoint, metrics: ViewportMetrics) {
        let next = ViewportTransform::new(
            pan.memo.scale,
            pan.memo.translate_x + (at.x - pan.origin.x) / metrics.factor,
            pan.memo.translate_y - (at.y - pan.origin.y) / metrics.factor,
        );
        self.commit(next);
    }

    /// Sets the scale to `target` while keeping the plane point under
    /// `origin` fixed on screen.
    fn zoom_around(&mut self, origin: ScreenPoint, target: f64, metrics: ViewportMetrics) {
        let current = self.transform;
        let scale = if target.is_finite() {
            target.clamp(self.settings.min_scale, VIEWPORT_MAX_SCALE)
        } else {
            current.scale
        };
        let world = screen_to_world(origin, metrics);
        let local_x = (world.x - current.translate_x) / current.scale;
        let local_y = (world.y - current.translate_y) / current.scale;
        let next = ViewportTransform::new(
            scale,
            world.x - local_x * scale,
            world.y - local_y * scale,
        );
        self.commit(next);
    }

    fn commit(&mut self, next: ViewportTransform) {
        let sanitized = next.sanitized(self.settings.min_scale, self.transform);
        if sanitized != next {
            tracing::debug!(?next, ?sanitized, "viewport transform clamped");
        }
        self.transform = sanitized;
    }

    fn resolve_image_point(&self, at: ScreenPoint) -> Option<ImagePoint> {
        let metrics = self.metrics?;
        let geometry = self.geometry?;
        let point = screen_to_image(at, metrics, self.transform, geometry);
        (point.x.is_finite() && point.y.is_finite()).then_some(point)
    }

    /// Records the latest position. Returns false for unknown pointers.
    fn track(&mut self, id: PointerId, at: ScreenPoint) -> bool {
        if let Some(entry) = self.pointers.iter_mut().find(|(pointer, _)| *pointer == id) {
            entry.1 = at;
            return true;
        }
        false
    }

    fn register(&mut self, id: PointerId, at: ScreenPoint) {
        if !self.track(id, at) {
            self.pointers.push((id, at));
        }
    }

    fn untrack(&mut self, id: PointerId) {
        self.pointers.retain(|(pointer, _)| *pointer != id);
    }

    fn position_of(&self, id: PointerId) -> Option<ScreenPoint> {
        self.pointers
            .iter()
            .find(|(pointer, _)| *pointer == id)
            .map(|(_, at)| *at)
    }
}
