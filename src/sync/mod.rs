//! Live session synchronizer.
//!
//! Turns inbound channel messages into store deltas, owns the fog and map
//! image slots, and sends local edits back out. Everything runs on the
//! caller's thread; image loads and debounced persists complete through
//! [`Synchronizer::poll`].

mod persist;
mod transport;

use std::time::Instant;

use thiserror::Error;

use crate::config::Role;
use crate::geometry::ImagePoint;
use crate::loader::{CacheBuster, ImageLoadManager, LoadPoll, LoadTask, SceneUrls};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::scene::{Scene, SceneId, TokenId, TokenPatch};
use crate::state::{ConnectionEvent, ConnectionState, StateError, StateMachine};
use crate::store::{ImageLayer, SceneDelta, SceneStore};

pub use persist::{PersistRequest, TokenPersistQueue};
pub use transport::{
    ApiError, ApiResult, ChannelError, ChannelResult, ChannelSink, SceneApi,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to fetch the active scene: {0}")]
    Api(#[from] ApiError),
    #[error("failed to publish to the channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("no scene is active")]
    NoActiveScene,
    #[error("token {token_id} is not in the active scene")]
    UnknownToken { token_id: TokenId },
    #[error("token {token_id} is locked")]
    TokenLocked { token_id: TokenId },
    #[error("token {token_id} cannot be moved by players")]
    NotMovableByPlayers { token_id: TokenId },
    #[error("only the game master may edit token {token_id}")]
    EditForbidden { token_id: TokenId },
    #[error("token patch for {token_id} is malformed")]
    InvalidPatch { token_id: TokenId },
    #[error("position ({x}, {y}) is not finite")]
    InvalidPosition { x: f64, y: f64 },
    #[error("session has been torn down")]
    TornDown,
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    Fog,
    Map,
}

/// Failures a user-facing collaborator may want to surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    PersistFailed { token_id: TokenId, message: String },
    ImageLoadFailed { slot: ImageSlot, message: String },
    ResyncFailed { message: String },
}

#[derive(Debug)]
struct SlotLoad {
    scene_id: SceneId,
    version: u64,
    task: LoadTask,
}

pub struct Synchronizer {
    store: SceneStore,
    api: Box<dyn SceneApi>,
    channel: Box<dyn ChannelSink>,
    loader: ImageLoadManager,
    urls: SceneUrls,
    role: Role,
    connection: StateMachine,
    persist: TokenPersistQueue,
    fog_buster: CacheBuster,
    fog_load: Option<SlotLoad>,
    map_load: Option<SlotLoad>,
    notices: Vec<SyncNotice>,
    torn_down: bool,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("store", &self.store)
            .field("role", &self.role)
            .field("connection", &self.connection.state())
            .field("persist", &self.persist)
            .field("fog_load", &self.fog_load)
            .field("map_load", &self.map_load)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    pub fn new(
        store: SceneStore,
        api: Box<dyn SceneApi>,
        channel: Box<dyn ChannelSink>,
        loader: ImageLoadManager,
        urls: SceneUrls,
        role: Role,
        persist: TokenPersistQueue,
    ) -> Self {
        Self {
            store,
            api,
            channel,
            loader,
            urls,
            role,
            connection: StateMachine::new(),
            persist,
            fog_buster: CacheBuster::new(),
            fog_load: None,
            map_load: None,
            notices: Vec::new(),
            torn_down: false,
        }
    }

    pub fn store(&self) -> &SceneStore {
        &self.store
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn take_notices(&mut self) -> Vec<SyncNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn has_pending_fog_load(&self) -> bool {
        self.fog_load.is_some()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Cancels in-flight image loads and drops unsent token edits. After
    /// this nothing reaches the store, the API or the channel again.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.cancel_slot(ImageSlot::Fog);
        self.cancel_slot(ImageSlot::Map);
        let dropped = self.persist.clear();
        self.torn_down = true;
        tracing::info!(dropped, "synchronizer torn down");
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.torn_down {
            return Err(SyncError::TornDown);
        }
        Ok(())
    }

    /// Channel came up: refetch the authoritative scene instead of trusting
    /// anything buffered.
    pub fn on_connected(&mut self) -> SyncResult<ConnectionState> {
        self.ensure_open()?;
        self.connection.transition(ConnectionEvent::Connected)?;
        tracing::info!("channel connected; resyncing");
        self.resync()
    }

    pub fn on_disconnected(&mut self) -> SyncResult<ConnectionState> {
        let state = self.connection.transition(ConnectionEvent::Disconnected)?;
        tracing::info!("channel disconnected");
        Ok(state)
    }

    /// Re-requests the active scene, e.g. when the window regains focus.
    pub fn refresh(&mut self) -> SyncResult<ConnectionState> {
        self.ensure_open()?;
        self.connection.transition(ConnectionEvent::RefreshRequested)?;
        self.resync()
    }

    fn resync(&mut self) -> SyncResult<ConnectionState> {
        match self.api.fetch_active_scene() {
            Ok(scene) => {
                self.switch_scene(scene);
                Ok(self.connection.transition(ConnectionEvent::SnapshotApplied)?)
            }
            Err(err) => {
                tracing::warn!(%err, "active scene refetch failed");
                self.notices.push(SyncNotice::ResyncFailed {
                    message: err.to_string(),
                });
                self.connection.transition(ConnectionEvent::SnapshotFailed)?;
                Err(err.into())
            }
        }
    }

    /// Decodes and applies one raw channel frame. Malformed frames are
    /// dropped. Returns whether the store changed or a load started.
    pub fn handle_inbound(&mut self, raw: &str, now: Instant) -> bool {
        match InboundMessage::parse(raw) {
            Ok(message) => self.handle_message(message, now),
            Err(err) => {
                tracing::warn!(%err, "dropping malformed channel message");
                false
            }
        }
    }

    pub fn handle_message(&mut self, message: InboundMessage, now: Instant) -> bool {
        if self.torn_down {
            tracing::debug!(kind = message.kind(), "channel message after teardown dropped");
            return false;
        }
        if !self.connection.state().accepts_deltas() {
            tracing::warn!(kind = message.kind(), "channel message while offline dropped");
            return false;
        }
        tracing::debug!(kind = message.kind(), "channel message received");
        match message {
            InboundMessage::SceneSwitched(payload) => {
                self.switch_scene(payload.scene);
                true
            }
            InboundMessage::FogUpdated(payload) => {
                if self.active_scene_id().as_ref() != Some(&payload.scene_id) {
                    tracing::debug!(scene_id = %payload.scene_id, "fog update for inactive scene");
                    return false;
                }
                self.start_fog_load(payload.scene_id);
                true
            }
            InboundMessage::TokenAdded(payload) => self.store.apply_delta(SceneDelta::AddToken {
                scene_id: payload.scene_id,
                token: payload.token,
                version: payload.version,
            }),
            InboundMessage::TokenUpdated(payload) => {
                self.store.apply_delta(SceneDelta::UpdateToken {
                    scene_id: payload.scene_id,
                    patch: payload.token,
                    version: payload.version,
                })
            }
            InboundMessage::TokenRemoved(payload) => {
                self.persist.cancel(&payload.token_id);
                self.store.apply_delta(SceneDelta::RemoveToken {
                    scene_id: payload.scene_id,
                    token_id: payload.token_id,
                    version: payload.version,
                })
            }
            InboundMessage::MarkArea(payload) => self.store.apply_delta(SceneDelta::AddMarker {
                id: payload.id,
                x: payload.x,
                y: payload.y,
                created_at: now,
            }),
            InboundMessage::MediaShared(payload) => {
                self.store.apply_delta(SceneDelta::ShareMedia(payload.id))
            }
        }
    }

    /// Optimistically moves a token and queues the debounced PATCH.
    pub fn move_token(
        &mut self,
        token_id: &TokenId,
        position: ImagePoint,
        now: Instant,
    ) -> SyncResult<()> {
        if !(position.x.is_finite() && position.y.is_finite()) {
            return Err(SyncError::InvalidPosition {
                x: position.x,
                y: position.y,
            });
        }
        self.check_movable(token_id)?;
        self.stage_edit(TokenPatch::position(token_id.clone(), position), now)
    }

    /// Game-master edit of arbitrary token fields.
    pub fn edit_token(&mut self, patch: TokenPatch, now: Instant) -> SyncResult<()> {
        if self.role != Role::Dm {
            return Err(SyncError::EditForbidden { token_id: patch.id });
        }
        if !patch.is_well_formed() {
            return Err(SyncError::InvalidPatch { token_id: patch.id });
        }
        self.stage_edit(patch, now)
    }

    fn stage_edit(&mut self, patch: TokenPatch, now: Instant) -> SyncResult<()> {
        self.ensure_open()?;
        let scene_id = self.active_scene_id().ok_or(SyncError::NoActiveScene)?;
        if patch.is_empty() {
            return Ok(());
        }
        self.store.apply_delta(SceneDelta::LocalTokenEdit {
            scene_id: scene_id.clone(),
            patch: patch.clone(),
        });
        self.persist.schedule(scene_id, patch, now);
        Ok(())
    }

    fn check_movable(&self, token_id: &TokenId) -> SyncResult<()> {
        let snapshot = self.store.get_snapshot();
        let scene = snapshot.scene.as_ref().ok_or(SyncError::NoActiveScene)?;
        let entry = scene.token(token_id).ok_or_else(|| SyncError::UnknownToken {
            token_id: token_id.clone(),
        })?;
        if entry.token.is_locked {
            return Err(SyncError::TokenLocked {
                token_id: token_id.clone(),
            });
        }
        if self.role == Role::Player && !entry.token.is_movable_by_players {
            return Err(SyncError::NotMovableByPlayers {
                token_id: token_id.clone(),
            });
        }
        Ok(())
    }

    /// Publishes a "look here" ping. The marker appears when the server
    /// echoes it back.
    pub fn mark_area(&mut self, point: ImagePoint) -> SyncResult<()> {
        self.ensure_open()?;
        if self.active_scene_id().is_none() {
            return Err(SyncError::NoActiveScene);
        }
        if !(point.x.is_finite() && point.y.is_finite()) {
            return Err(SyncError::InvalidPosition {
                x: point.x,
                y: point.y,
            });
        }
        self.channel.emit(&OutboundMessage::MarkArea(point.into()))?;
        tracing::debug!(x = point.x, y = point.y, "mark-area published");
        Ok(())
    }

    pub fn dismiss_shared_media(&mut self) -> bool {
        self.store.apply_delta(SceneDelta::DismissMedia)
    }

    /// Drives completions: finished image loads, due persists, expired
    /// markers.
    pub fn poll(&mut self, now: Instant) {
        if self.torn_down {
            return;
        }
        self.poll_slot(ImageSlot::Fog);
        self.poll_slot(ImageSlot::Map);
        self.flush_persists(now);
        self.store.expire_markers(now);
    }

    /// Earliest instant at which `poll` has timed work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.torn_down {
            return None;
        }
        match (self.persist.next_deadline(), self.store.next_marker_expiry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn active_scene_id(&self) -> Option<SceneId> {
        self.store.get_snapshot().scene_id().cloned()
    }

    fn switch_scene(&mut self, scene: Option<Scene>) {
        let Some(scene) = scene else {
            self.cancel_slot(ImageSlot::Fog);
            self.cancel_slot(ImageSlot::Map);
            self.store.apply_delta(SceneDelta::ReplaceScene(None));
            tracing::info!("no active scene");
            return;
        };
        let scene_id = scene.id.clone();
        let resource_version = scene.image_resource_version;
        let same_scene = self.active_scene_id().as_ref() == Some(&scene_id);
        if !same_scene {
            self.cancel_slot(ImageSlot::Fog);
            self.cancel_slot(ImageSlot::Map);
        }
        self.store.apply_delta(SceneDelta::ReplaceScene(Some(scene)));
        tracing::info!(scene_id = %scene_id, same_scene, "scene applied");
        self.start_fog_load(scene_id.clone());
        self.start_map_load(scene_id, resource_version);
    }

    fn start_fog_load(&mut self, scene_id: SceneId) {
        let version = self.fog_buster.next_value();
        let url = self.urls.fog_url(&scene_id, version);
        self.cancel_slot(ImageSlot::Fog);
        tracing::debug!(scene_id = %scene_id, version, "fog load started");
        self.fog_load = Some(SlotLoad {
            scene_id,
            version,
            task: self.loader.load(url),
        });
    }

    fn start_map_load(&mut self, scene_id: SceneId, version: u64) {
        let snapshot = self.store.get_snapshot();
        let applied = snapshot
            .scene
            .as_ref()
            .filter(|scene| scene.id == scene_id)
            .and_then(|scene| scene.map_version());
        if applied.is_some_and(|applied| version <= applied) {
            return;
        }
        if self
            .map_load
            .as_ref()
            .is_some_and(|load| load.scene_id == scene_id && load.version >= version)
        {
            return;
        }
        let url = self.urls.map_url(&scene_id, version);
        self.cancel_slot(ImageSlot::Map);
        tracing::debug!(scene_id = %scene_id, version, "map load started");
        self.map_load = Some(SlotLoad {
            scene_id,
            version,
            task: self.loader.load(url),
        });
    }

    fn slot_mut(&mut self, slot: ImageSlot) -> &mut Option<SlotLoad> {
        match slot {
            ImageSlot::Fog => &mut self.fog_load,
            ImageSlot::Map => &mut self.map_load,
        }
    }

    fn cancel_slot(&mut self, slot: ImageSlot) {
        if let Some(load) = self.slot_mut(slot).take() {
            load.task.cancel();
        }
    }

    fn poll_slot(&mut self, slot: ImageSlot) {
        let Some(load) = self.slot_mut(slot).as_mut() else {
            return;
        };
        let outcome = load.task.poll();
        if matches!(outcome, LoadPoll::Pending) {
            return;
        }
        let Some(load) = self.slot_mut(slot).take() else {
            return;
        };
        match outcome {
            LoadPoll::Ready(Ok(image)) => {
                let layer = ImageLayer::new(load.version, image);
                let scene_id = load.scene_id;
                let delta = match slot {
                    ImageSlot::Fog => SceneDelta::ApplyFog { scene_id, layer },
                    ImageSlot::Map => SceneDelta::ApplyMap { scene_id, layer },
                };
                self.store.apply_delta(delta);
            }
            LoadPoll::Ready(Err(err)) => {
                tracing::warn!(%err, ?slot, "image load failed; keeping previous raster");
                self.notices.push(SyncNotice::ImageLoadFailed {
                    slot,
                    message: err.to_string(),
                });
            }
            LoadPoll::Pending | LoadPoll::Closed => {}
        }
    }

    fn flush_persists(&mut self, now: Instant) {
        for request in self.persist.due(now) {
            let PersistRequest { scene_id, patch } = request;
            let body = match serde_json::to_value(&patch) {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(%err, token_id = %patch.id, "token patch could not be encoded");
                    continue;
                }
            };
            match self.api.patch_token(&scene_id, &patch.id, body) {
                Ok(()) => {
                    tracing::debug!(token_id = %patch.id, "token persisted");
                    self.store
                        .apply_delta(SceneDelta::TokenPersisted { scene_id, patch });
                }
                Err(err) => {
                    tracing::warn!(%err, token_id = %patch.id, "token persist failed; keeping local state");
                    self.notices.push(SyncNotice::PersistFailed {
                        token_id: patch.id.clone(),
                        message: err.to_string(),
                    });
                    self.store.apply_delta(SceneDelta::TokenPersistFailed {
                        scene_id,
                        token_id: patch.id,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct PatchCall {
        pub(crate) scene_id: SceneId,
        pub(crate) token_id: TokenId,
        pub(crate) body: serde_json::Value,
    }

    #[derive(Default)]
    pub(crate) struct ApiLog {
        pub(crate) active: RefCell<Option<Scene>>,
        pub(crate) fail_fetch: RefCell<bool>,
        pub(crate) fail_patch: RefCell<bool>,
        pub(crate) fetches: RefCell<usize>,
        pub(crate) patches: RefCell<Vec<PatchCall>>,
    }

    pub(crate) struct RecordingApi(pub(crate) Rc<ApiLog>);

    impl SceneApi for RecordingApi {
        fn fetch_active_scene(&self) -> ApiResult<Option<Scene>> {
            *self.0.fetches.borrow_mut() += 1;
            if *self.0.fail_fetch.borrow() {
                return Err(ApiError::Transport {
                    route: "/active-map".to_string(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(self.0.active.borrow().clone())
        }

        fn patch_token(
            &self,
            scene_id: &SceneId,
            token_id: &TokenId,
            body: serde_json::Value,
        ) -> ApiResult<()> {
            self.0.patches.borrow_mut().push(PatchCall {
                scene_id: scene_id.clone(),
                token_id: token_id.clone(),
                body,
            });
            if *self.0.fail_patch.borrow() {
                return Err(ApiError::Rejected {
                    route: format!("/map/{scene_id}/token/{token_id}"),
                    status: 401,
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingChannel(pub(crate) Rc<RefCell<Vec<OutboundMessage>>>);

    impl ChannelSink for RecordingChannel {
        fn emit(&self, message: &OutboundMessage) -> ChannelResult<()> {
            self.0.borrow_mut().push(message.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    use super::test_support::{ApiLog, RecordingApi, RecordingChannel};
    use super::*;
    use crate::loader::test_support::{png_bytes, GatedFetcher, MemoryFetcher};
    use crate::scene::Token;

    struct Harness {
        sync: Synchronizer,
        api: Rc<ApiLog>,
        sent: Rc<RefCell<Vec<OutboundMessage>>>,
        fetcher: Arc<MemoryFetcher>,
    }

    fn token(id: &str, movable: bool, locked: bool) -> Token {
        Token {
            id: TokenId::from(id),
            x: 10.0,
            y: 10.0,
            radius: 5.0,
            color: "red".to_string(),
            label: String::new(),
            is_visible_for_players: true,
            is_movable_by_players: movable,
            is_locked: locked,
            reference: None,
        }
    }

    fn harness(role: Role, active: Option<Scene>) -> Harness {
        let api = Rc::new(ApiLog::default());
        *api.active.borrow_mut() = active;
        let sent = Rc::new(RefCell::new(Vec::new()));
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.insert("/map/m1/fog-live", png_bytes(4, 4, [0, 0, 0, 255]));
        fetcher.insert("/map/m1/map", png_bytes(8, 6, [10, 20, 30, 255]));
        fetcher.insert("/map/m2/fog-live", png_bytes(4, 4, [0, 0, 0, 128]));
        fetcher.insert("/map/m2/map", png_bytes(8, 6, [1, 1, 1, 255]));
        let sync = synchronizer(&api, &sent, ImageLoadManager::inline(fetcher.clone()), role);
        Harness {
            sync,
            api,
            sent,
            fetcher,
        }
    }

    fn synchronizer(
        api: &Rc<ApiLog>,
        sent: &Rc<RefCell<Vec<OutboundMessage>>>,
        loader: ImageLoadManager,
        role: Role,
    ) -> Synchronizer {
        Synchronizer::new(
            SceneStore::new(Duration::from_millis(1250)),
            Box::new(RecordingApi(Rc::clone(api))),
            Box::new(RecordingChannel(Rc::clone(sent))),
            loader,
            SceneUrls::new("", None).expect("empty base is path-only"),
            role,
            TokenPersistQueue::new(Duration::from_millis(100)),
        )
    }

    /// Polls until `done` holds or a few seconds pass.
    fn poll_until(sync: &mut Synchronizer, done: impl Fn(&Synchronizer) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            sync.poll(Instant::now());
            if done(sync) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn scene(id: &str, tokens: Vec<Token>) -> Scene {
        Scene {
            tokens,
            ..Scene::new(id)
        }
    }

    fn live(role: Role, active: Option<Scene>) -> Harness {
        let mut h = harness(role, active);
        h.sync.on_connected().expect("resync should succeed");
        h
    }

    fn fog_version(sync: &Synchronizer) -> Option<u64> {
        sync.store()
            .get_snapshot()
            .scene
            .as_ref()
            .and_then(|scene| scene.fog_version())
    }

    #[test]
    fn connect_refetches_active_scene_and_goes_live() {
        let mut h = harness(Role::Player, Some(scene("m1", vec![token("t1", true, false)])));
        let state = h.sync.on_connected().expect("connect should resync");
        assert_eq!(state, ConnectionState::Live);
        assert_eq!(*h.api.fetches.borrow(), 1);

        h.sync.poll(Instant::now());
        let snapshot = h.sync.store().get_snapshot();
        let view = snapshot.scene.as_ref().expect("scene should be active");
        assert_eq!(view.fog_version(), Some(0));
        assert_eq!(view.map_version(), Some(0));
        assert_eq!(view.tokens.len(), 1);
    }

    #[test]
    fn failed_refetch_stays_resyncing_and_reports() {
        let mut h = harness(Role::Player, None);
        *h.api.fail_fetch.borrow_mut() = true;
        assert!(matches!(h.sync.on_connected(), Err(SyncError::Api(_))));
        assert_eq!(h.sync.connection_state(), ConnectionState::Resyncing);
        assert!(matches!(
            h.sync.take_notices().as_slice(),
            [SyncNotice::ResyncFailed { .. }]
        ));

        *h.api.fail_fetch.borrow_mut() = false;
        assert_eq!(h.sync.refresh().expect("retry works"), ConnectionState::Live);
    }

    #[test]
    fn messages_while_offline_are_dropped() {
        let mut h = harness(Role::Player, None);
        let applied = h.sync.handle_inbound(
            r#"{"type":"media-shared","payload":{"id":"n1"}}"#,
            Instant::now(),
        );
        assert!(!applied);
        assert!(h.sync.store().get_snapshot().shared_media.is_none());
    }

    #[test]
    fn duplicate_fog_updates_apply_only_the_latest_load() {
        let mut h = live(Role::Player, Some(scene("m1", Vec::new())));
        h.sync.poll(Instant::now());
        assert_eq!(fog_version(&h.sync), Some(0));

        let now = Instant::now();
        h.sync.handle_inbound(r#"{"type":"fog-updated","payload":{"sceneId":"m1"}}"#, now);
        h.sync.handle_inbound(r#"{"type":"fog-updated","payload":{"sceneId":"m1"}}"#, now);
        let revision = h.sync.store().get_snapshot().revision;
        h.sync.poll(now);

        assert_eq!(fog_version(&h.sync), Some(2));
        assert_eq!(h.sync.store().get_snapshot().revision, revision + 1);
        let fog_requests = h
            .fetcher
            .requests()
            .iter()
            .filter(|url| url.contains("fog-live"))
            .count();
        assert_eq!(fog_requests, 3);
    }

    #[test]
    fn superseded_background_fog_load_never_reaches_the_store() {
        let api = Rc::new(ApiLog::default());
        *api.active.borrow_mut() = Some(scene("m1", Vec::new()));
        let sent = Rc::new(RefCell::new(Vec::new()));
        let gate = Arc::new(GatedFetcher::default());
        let mut sync = synchronizer(&api, &sent, ImageLoadManager::new(gate.clone()), Role::Player);
        sync.on_connected().expect("connect should resync");

        gate.release("/map/m1/map?cache_buster=0", png_bytes(8, 6, [1, 2, 3, 255]));
        let map_applied = poll_until(&mut sync, |sync| {
            sync.store()
                .get_snapshot()
                .scene
                .as_ref()
                .and_then(|scene| scene.map_version())
                .is_some()
        });
        assert!(map_applied, "map load should finish");

        let now = Instant::now();
        sync.handle_inbound(r#"{"type":"fog-updated","payload":{"sceneId":"m1"}}"#, now);
        sync.handle_inbound(r#"{"type":"fog-updated","payload":{"sceneId":"m1"}}"#, now);
        let revision = sync.store().get_snapshot().revision;

        gate.release("/map/m1/fog-live?cache_buster=2", png_bytes(4, 4, [0, 0, 0, 90]));
        assert!(poll_until(&mut sync, |sync| fog_version(sync) == Some(2)));
        assert_eq!(sync.store().get_snapshot().revision, revision + 1);

        gate.release("/map/m1/fog-live?cache_buster=1", png_bytes(4, 4, [0, 0, 0, 10]));
        gate.release("/map/m1/fog-live?cache_buster=0", png_bytes(4, 4, [0, 0, 0, 20]));
        let stale_applied = poll_until(&mut sync, |sync| fog_version(sync) != Some(2));
        assert!(!stale_applied, "a cancelled fog load replaced the latest raster");
        assert_eq!(sync.store().get_snapshot().revision, revision + 1);
    }

    #[test]
    fn teardown_cancels_loads_and_drops_unsent_edits() {
        let api = Rc::new(ApiLog::default());
        *api.active.borrow_mut() = Some(scene("m1", vec![token("t1", true, false)]));
        let sent = Rc::new(RefCell::new(Vec::new()));
        let gate = Arc::new(GatedFetcher::default());
        let mut sync = synchronizer(&api, &sent, ImageLoadManager::new(gate.clone()), Role::Player);
        sync.on_connected().expect("connect should resync");
        let start = Instant::now();
        sync.move_token(&TokenId::from("t1"), ImagePoint::new(40.0, 40.0), start)
            .expect("move should be accepted");
        let revision = sync.store().get_snapshot().revision;

        sync.teardown();
        sync.teardown();
        assert!(sync.is_torn_down());
        assert!(!sync.has_pending_fog_load());
        assert_eq!(sync.next_deadline(), None);

        gate.release("/map/m1/fog-live?cache_buster=0", png_bytes(4, 4, [0, 0, 0, 255]));
        gate.release("/map/m1/map?cache_buster=0", png_bytes(8, 6, [1, 2, 3, 255]));
        std::thread::sleep(Duration::from_millis(20));
        sync.poll(start + Duration::from_secs(1));

        assert!(api.patches.borrow().is_empty());
        assert_eq!(sync.store().get_snapshot().revision, revision);
        assert!(!sync.handle_inbound(
            r#"{"type":"media-shared","payload":{"id":"n1"}}"#,
            start
        ));
        assert!(matches!(sync.mark_area(ImagePoint::new(1.0, 1.0)), Err(SyncError::TornDown)));
        assert!(matches!(
            sync.move_token(&TokenId::from("t1"), ImagePoint::new(1.0, 1.0), start),
            Err(SyncError::TornDown)
        ));
        assert!(matches!(sync.refresh(), Err(SyncError::TornDown)));
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn failed_fog_load_keeps_previous_raster() {
        let mut h = live(Role::Player, Some(scene("m1", Vec::new())));
        h.sync.poll(Instant::now());
        h.fetcher.insert("/map/m1/fog-live", b"garbage".to_vec());

        h.sync.handle_inbound(
            r#"{"type":"fog-updated","payload":{"sceneId":"m1"}}"#,
            Instant::now(),
        );
        h.sync.poll(Instant::now());

        assert_eq!(fog_version(&h.sync), Some(0));
        assert!(matches!(
            h.sync.take_notices().as_slice(),
            [SyncNotice::ImageLoadFailed { slot: ImageSlot::Fog, .. }]
        ));
    }

    #[test]
    fn switching_scene_cancels_loads_for_the_previous_one() {
        let mut h = live(Role::Player, Some(scene("m1", Vec::new())));
        let switch = serde_json::json!({
            "type": "scene-switched",
            "payload": { "scene": { "id": "m2", "imageResourceVersion": 3 } }
        });
        h.sync.handle_inbound(&switch.to_string(), Instant::now());
        h.sync.poll(Instant::now());

        let snapshot = h.sync.store().get_snapshot();
        let view = snapshot.scene.as_ref().expect("m2 should be active");
        assert_eq!(view.id.as_str(), "m2");
        assert_eq!(view.fog_version(), Some(1));
        assert_eq!(view.map_version(), Some(3));

        h.sync.handle_inbound(
            r#"{"type":"scene-switched","payload":{"scene":null}}"#,
            Instant::now(),
        );
        assert!(h.sync.store().get_snapshot().scene.is_none());
        assert!(!h.sync.has_pending_fog_load());
    }

    #[test]
    fn map_reloads_only_for_newer_resource_versions() {
        let mut h = live(Role::Player, Some(scene("m1", Vec::new())));
        h.sync.poll(Instant::now());
        let map_requests = |h: &Harness| {
            h.fetcher
                .requests()
                .iter()
                .filter(|url| url.contains("/map?"))
                .count()
        };
        assert_eq!(map_requests(&h), 1);

        let same = serde_json::json!({
            "type": "scene-switched",
            "payload": { "scene": { "id": "m1", "imageResourceVersion": 0 } }
        });
        h.sync.handle_inbound(&same.to_string(), Instant::now());
        h.sync.poll(Instant::now());
        assert_eq!(map_requests(&h), 1);
        assert_eq!(fog_version(&h.sync), Some(1));

        let newer = serde_json::json!({
            "type": "scene-switched",
            "payload": { "scene": { "id": "m1", "imageResourceVersion": 5 } }
        });
        h.sync.handle_inbound(&newer.to_string(), Instant::now());
        h.sync.poll(Instant::now());
        assert_eq!(map_requests(&h), 2);
    }

    #[test]
    fn move_token_is_optimistic_and_debounced() {
        let mut h = live(Role::Player, Some(scene("m1", vec![token("t1", true, false)])));
        let start = Instant::now();
        for step in 0..5u64 {
            let now = start + Duration::from_millis(step * 50);
            h.sync.poll(now);
            h.sync
                .move_token(&TokenId::from("t1"), ImagePoint::new(20.0 + step as f64, 30.0), now)
                .expect("move should be accepted");
        }

        let snapshot = h.sync.store().get_snapshot();
        let entry = snapshot
            .scene
            .as_ref()
            .and_then(|s| s.token(&TokenId::from("t1")))
            .expect("token should exist");
        assert_eq!(entry.token.x, 24.0);
        assert!(entry.is_pending());
        assert!(h.api.patches.borrow().is_empty());

        h.sync.poll(start + Duration::from_millis(300));
        let patches = h.api.patches.borrow();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].body, serde_json::json!({ "x": 24.0, "y": 30.0 }));
        assert_eq!(patches[0].token_id.as_str(), "t1");
    }

    #[test]
    fn move_permissions_follow_role_and_lock() {
        let tokens = vec![token("free", true, false), token("fixed", false, false), token("locked", true, true)];
        let mut player = live(Role::Player, Some(scene("m1", tokens.clone())));
        let now = Instant::now();
        let to = ImagePoint::new(1.0, 1.0);

        assert!(player.sync.move_token(&TokenId::from("free"), to, now).is_ok());
        assert!(matches!(
            player.sync.move_token(&TokenId::from("fixed"), to, now),
            Err(SyncError::NotMovableByPlayers { .. })
        ));
        assert!(matches!(
            player.sync.move_token(&TokenId::from("locked"), to, now),
            Err(SyncError::TokenLocked { .. })
        ));
        assert!(matches!(
            player.sync.move_token(&TokenId::from("ghost"), to, now),
            Err(SyncError::UnknownToken { .. })
        ));

        let mut dm = live(Role::Dm, Some(scene("m1", tokens)));
        assert!(dm.sync.move_token(&TokenId::from("fixed"), to, now).is_ok());
        assert!(matches!(
            dm.sync.move_token(&TokenId::from("locked"), to, now),
            Err(SyncError::TokenLocked { .. })
        ));
    }

    #[test]
    fn rejected_persist_marks_failed_without_rollback() {
        let mut h = live(Role::Player, Some(scene("m1", vec![token("t1", true, false)])));
        *h.api.fail_patch.borrow_mut() = true;
        let start = Instant::now();
        h.sync
            .move_token(&TokenId::from("t1"), ImagePoint::new(99.0, 98.0), start)
            .expect("move should be accepted");
        h.sync.poll(start + Duration::from_millis(100));

        let snapshot = h.sync.store().get_snapshot();
        let entry = snapshot
            .scene
            .as_ref()
            .and_then(|s| s.token(&TokenId::from("t1")))
            .expect("token should exist");
        assert_eq!(entry.token.x, 99.0);
        assert_eq!(entry.sync, crate::store::TokenSync::Failed);
        assert!(matches!(
            h.sync.take_notices().as_slice(),
            [SyncNotice::PersistFailed { .. }]
        ));
    }

    #[test]
    fn mark_area_is_published_but_not_added_locally() {
        let mut h = live(Role::Player, Some(scene("m1", Vec::new())));
        h.sync
            .mark_area(ImagePoint::new(5.0, 6.0))
            .expect("mark should publish");
        assert_eq!(h.sent.borrow().len(), 1);
        let snapshot = h.sync.store().get_snapshot();
        assert!(snapshot.scene.as_ref().is_some_and(|s| s.markers.is_empty()));

        let now = Instant::now();
        h.sync.handle_inbound(
            r#"{"type":"mark-area","payload":{"id":"p1","x":5.0,"y":6.0}}"#,
            now,
        );
        let snapshot = h.sync.store().get_snapshot();
        assert_eq!(snapshot.scene.as_ref().map(|s| s.markers.len()), Some(1));

        h.sync.poll(now + Duration::from_millis(1250));
        let snapshot = h.sync.store().get_snapshot();
        assert_eq!(snapshot.scene.as_ref().map(|s| s.markers.len()), Some(0));
    }

    #[test]
    fn malformed_messages_leave_store_untouched() {
        let mut h = live(Role::Player, Some(scene("m1", Vec::new())));
        let before = h.sync.store().get_snapshot();
        assert!(!h.sync.handle_inbound("{", Instant::now()));
        assert!(!h.sync.handle_inbound(
            r#"{"type":"token-added","payload":{"sceneId":"m1","token":{"id":"t1","x":"left"}}}"#,
            Instant::now()
        ));
        assert_eq!(*h.sync.store().get_snapshot(), *before);
    }

    #[test]
    fn shared_media_is_cleared_only_by_dismissal() {
        let mut h = live(Role::Player, Some(scene("m1", Vec::new())));
        h.sync.handle_inbound(
            r#"{"type":"media-shared","payload":{"id":"n1"}}"#,
            Instant::now(),
        );
        h.sync.handle_inbound(
            r#"{"type":"scene-switched","payload":{"scene":null}}"#,
            Instant::now(),
        );
        assert!(h.sync.store().get_snapshot().shared_media.is_some());
        assert!(h.sync.dismiss_shared_media());
        assert!(h.sync.store().get_snapshot().shared_media.is_none());
    }

    #[test]
    fn players_cannot_edit_token_fields() {
        let mut h = live(Role::Player, Some(scene("m1", vec![token("t1", true, false)])));
        let mut patch = TokenPatch::new(TokenId::from("t1"));
        patch.label = Some("Boss".to_string());
        assert!(matches!(
            h.sync.edit_token(patch, Instant::now()),
            Err(SyncError::EditForbidden { .. })
        ));
    }
}
