use std::sync::Arc;
use std::time::Instant;

use crate::config::{Role, SessionConfig};
use crate::geometry::ImagePoint;
use crate::loader::{ImageLoadManager, SceneUrls, UrlError};
use crate::scene::TokenId;
use crate::state::ConnectionState;
use crate::store::{SceneSnapshot, SceneStore};
use crate::sync::{
    ChannelSink, SceneApi, SyncNotice, SyncResult, Synchronizer, TokenPersistQueue,
};
use crate::transform::RenderGeometry;
use crate::viewport::{
    GestureController, GestureIntent, HoverContext, PointerEvent, ViewportMetrics,
    ViewportTransform, WheelEvent,
};

/// What the renderer draws for one frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub snapshot: Arc<SceneSnapshot>,
    pub transform: ViewportTransform,
    /// `None` until both the map image and viewport metrics are known.
    pub geometry: Option<RenderGeometry>,
}

/// Renderer-facing entry point tying gestures to the synchronizer.
#[derive(Debug)]
pub struct Session {
    sync: Synchronizer,
    gestures: GestureController,
    hover: HoverContext,
    metrics: Option<ViewportMetrics>,
    fit_ratio: f64,
}

impl Session {
    pub fn new(
        config: &SessionConfig,
        api: Box<dyn SceneApi>,
        channel: Box<dyn ChannelSink>,
        loader: ImageLoadManager,
    ) -> Result<Self, UrlError> {
        let urls = SceneUrls::new(&config.api_base_url, config.authorization.clone())?;
        let sync = Synchronizer::new(
            SceneStore::new(config.marker_lifetime()),
            api,
            channel,
            loader,
            urls,
            config.role,
            TokenPersistQueue::new(config.persist_debounce()),
        );
        Ok(Self {
            sync,
            gestures: GestureController::new(config.gesture_settings()),
            hover: HoverContext::new(),
            metrics: None,
            fit_ratio: config.effective_fit_ratio(),
        })
    }

    pub fn frame(&self) -> Frame {
        Frame {
            snapshot: self.sync.store().get_snapshot(),
            transform: self.gestures.transform(),
            geometry: self.gestures.geometry(),
        }
    }

    pub fn role(&self) -> Role {
        self.sync.role()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn synchronizer_mut(&mut self) -> &mut Synchronizer {
        &mut self.sync
    }

    pub fn gestures(&self) -> &GestureController {
        &self.gestures
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.sync.connection_state()
    }

    pub fn on_connected(&mut self) -> SyncResult<ConnectionState> {
        let state = self.sync.on_connected();
        self.refresh_geometry();
        state
    }

    pub fn on_disconnected(&mut self) -> SyncResult<ConnectionState> {
        self.sync.on_disconnected()
    }

    pub fn refresh(&mut self) -> SyncResult<ConnectionState> {
        let state = self.sync.refresh();
        self.refresh_geometry();
        state
    }

    pub fn handle_inbound(&mut self, raw: &str, now: Instant) -> bool {
        let applied = self.sync.handle_inbound(raw, now);
        self.refresh_geometry();
        applied
    }

    pub fn set_viewport(&mut self, metrics: ViewportMetrics) {
        self.gestures.set_metrics(metrics);
        self.metrics = self.gestures.metrics();
        self.refresh_geometry();
    }

    pub fn set_hover(&mut self, token_id: TokenId, position: ImagePoint) {
        self.hover.enter(token_id, position);
    }

    pub fn clear_hover(&mut self, token_id: &TokenId) {
        self.hover.leave(token_id);
    }

    /// Feeds one pointer event. Drag-end and mark intents are forwarded to
    /// the synchronizer; all intents are returned for local feedback.
    pub fn pointer(&mut self, event: PointerEvent, now: Instant) -> Vec<GestureIntent> {
        let intents = self.gestures.handle_pointer(event, &self.hover, now);
        self.route(&intents, now);
        intents
    }

    pub fn wheel(&mut self, event: WheelEvent, now: Instant) {
        self.gestures.handle_wheel(event, now);
    }

    /// Advances timers and completions. Call at least by `next_deadline`.
    pub fn tick(&mut self, now: Instant) -> Vec<GestureIntent> {
        if self.is_torn_down() {
            return Vec::new();
        }
        let intents = self.gestures.tick(now);
        self.route(&intents, now);
        self.sync.poll(now);
        self.refresh_geometry();
        intents
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.gestures.next_deadline(), self.sync.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn center(&mut self) {
        self.gestures.center();
    }

    pub fn dismiss_shared_media(&mut self) -> bool {
        self.sync.dismiss_shared_media()
    }

    pub fn take_notices(&mut self) -> Vec<SyncNotice> {
        self.sync.take_notices()
    }

    /// Stops timers, cancels image loads and drops unsent token edits.
    pub fn teardown(&mut self) {
        self.gestures.teardown();
        self.hover.clear();
        self.sync.teardown();
    }

    pub fn is_torn_down(&self) -> bool {
        self.sync.is_torn_down()
    }

    fn route(&mut self, intents: &[GestureIntent], now: Instant) {
        for intent in intents {
            let result = match intent {
                GestureIntent::MarkArea(point) => self.sync.mark_area(*point),
                GestureIntent::TokenDragEnd { token_id, position } => {
                    self.sync.move_token(token_id, *position, now)
                }
                GestureIntent::TokenDragMove { .. } => Ok(()),
            };
            if let Err(err) = result {
                tracing::warn!(%err, ?intent, "gesture intent rejected");
            }
        }
    }

    fn refresh_geometry(&mut self) {
        let geometry = self.metrics.and_then(|metrics| {
            let snapshot = self.sync.store().get_snapshot();
            let bounds = snapshot.scene.as_ref()?.map_image.as_ref()?.bounds();
            RenderGeometry::fit(bounds, metrics, self.fit_ratio)
        });
        if geometry != self.gestures.geometry() {
            self.gestures.set_geometry(geometry);
        }
    }
}
