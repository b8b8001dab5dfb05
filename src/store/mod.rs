//! Local mirror of the active scene.
//!
//! The store is the only writer of scene, token, fog and marker state. Every
//! accepted change produces a new [`SceneSnapshot`] behind an `Arc`; readers
//! holding an older snapshot keep seeing exactly what they were handed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Role;
use crate::geometry::ImageBounds;
use crate::loader::LoadedImage;
use crate::scene::{Grid, MarkerId, MediaId, Marker, Scene, SceneId, Token, TokenId, TokenPatch};

/// Reconciliation state of one token against the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TokenSync {
    #[default]
    Confirmed,
    /// Local edit not yet echoed back. Holds the expected field values.
    Pending(TokenPatch),
    /// The last persist attempt was rejected; local values are kept.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenEntry {
    pub token: Token,
    pub sync: TokenSync,
}

impl TokenEntry {
    pub fn confirmed(token: Token) -> Self {
        Self {
            token,
            sync: TokenSync::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.sync, TokenSync::Pending(_))
    }

    /// Takes an authoritative full token, keeping unconfirmed local values.
    fn reconcile(&self, incoming: Token) -> TokenEntry {
        match &self.sync {
            TokenSync::Pending(expected) => {
                let remaining = expected.unsatisfied_by(&incoming);
                let mut token = incoming;
                if remaining.is_empty() {
                    return TokenEntry::confirmed(token);
                }
                remaining.merge_into(&mut token);
                TokenEntry {
                    token,
                    sync: TokenSync::Pending(remaining),
                }
            }
            TokenSync::Confirmed | TokenSync::Failed => TokenEntry::confirmed(incoming),
        }
    }
}

/// A decoded raster tagged with the version it was loaded for.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageLayer {
    pub version: u64,
    pub image: LoadedImage,
}

impl ImageLayer {
    pub fn new(version: u64, image: LoadedImage) -> Self {
        Self { version, image }
    }

    pub fn bounds(&self) -> ImageBounds {
        self.image.bounds()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneView {
    pub id: SceneId,
    pub image_resource_version: u64,
    pub grid: Option<Grid>,
    pub show_grid_to_players: bool,
    pub tokens: Vec<TokenEntry>,
    pub markers: Vec<Marker>,
    pub map_image: Option<ImageLayer>,
    /// `None` renders as blank fog.
    pub fog: Option<ImageLayer>,
}

impl SceneView {
    fn from_scene(scene: Scene) -> Self {
        Self {
            id: scene.id,
            image_resource_version: scene.image_resource_version,
            grid: scene.grid,
            show_grid_to_players: scene.show_grid_to_players,
            tokens: scene.tokens.into_iter().map(TokenEntry::confirmed).collect(),
            markers: Vec::new(),
            map_image: None,
            fog: None,
        }
    }

    pub fn token(&self, id: &TokenId) -> Option<&TokenEntry> {
        self.tokens.iter().find(|entry| &entry.token.id == id)
    }

    fn token_mut(&mut self, id: &TokenId) -> Option<&mut TokenEntry> {
        self.tokens.iter_mut().find(|entry| &entry.token.id == id)
    }

    /// Tokens a renderer for `role` may draw.
    pub fn visible_tokens(&self, role: Role) -> impl Iterator<Item = &TokenEntry> {
        self.tokens
            .iter()
            .filter(move |entry| role == Role::Dm || entry.token.is_visible_for_players)
    }

    pub fn grid_for(&self, role: Role) -> Option<&Grid> {
        match role {
            Role::Dm => self.grid.as_ref(),
            Role::Player if self.show_grid_to_players => self.grid.as_ref(),
            Role::Player => None,
        }
    }

    pub fn fog_version(&self) -> Option<u64> {
        self.fog.as_ref().map(|layer| layer.version)
    }

    pub fn map_version(&self) -> Option<u64> {
        self.map_image.as_ref().map(|layer| layer.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneSnapshot {
    pub revision: u64,
    /// `None` is the idle state: nothing to render.
    pub scene: Option<SceneView>,
    pub shared_media: Option<MediaId>,
}

impl SceneSnapshot {
    pub fn scene_id(&self) -> Option<&SceneId> {
        self.scene.as_ref().map(|scene| &scene.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SceneDelta {
    /// Wholesale replacement. The same id keeps loaded rasters and pending
    /// local edits.
    ReplaceScene(Option<Scene>),
    AddToken {
        scene_id: SceneId,
        token: Token,
        version: Option<u64>,
    },
    UpdateToken {
        scene_id: SceneId,
        patch: TokenPatch,
        version: Option<u64>,
    },
    RemoveToken {
        scene_id: SceneId,
        token_id: TokenId,
        version: Option<u64>,
    },
    LocalTokenEdit {
        scene_id: SceneId,
        patch: TokenPatch,
    },
    TokenPersisted {
        scene_id: SceneId,
        patch: TokenPatch,
    },
    TokenPersistFailed {
        scene_id: SceneId,
        token_id: TokenId,
    },
    AddMarker {
        id: MarkerId,
        x: f64,
        y: f64,
        created_at: Instant,
    },
    ApplyFog {
        scene_id: SceneId,
        layer: ImageLayer,
    },
    ApplyMap {
        scene_id: SceneId,
        layer: ImageLayer,
    },
    ShareMedia(MediaId),
    DismissMedia,
}

pub type SnapshotListener = Rc<dyn Fn(&Arc<SceneSnapshot>)>;

/// Keeps a listener registered until dropped.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct StoreSubscription {
    listener: SnapshotListener,
    listeners: Rc<RefCell<Vec<SnapshotListener>>>,
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        let mut listeners = self.listeners.borrow_mut();
        listeners.retain(|item| !Rc::ptr_eq(item, &self.listener));
    }
}

impl std::fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSubscription").finish_non_exhaustive()
    }
}

pub struct SceneStore {
    snapshot: Arc<SceneSnapshot>,
    listeners: Rc<RefCell<Vec<SnapshotListener>>>,
    token_versions: HashMap<TokenId, u64>,
    marker_lifetime: Duration,
    dirty: bool,
}

impl std::fmt::Debug for SceneStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneStore")
            .field("revision", &self.snapshot.revision)
            .field("scene_id", &self.snapshot.scene_id())
            .field("listeners", &self.listeners.borrow().len())
            .finish_non_exhaustive()
    }
}

impl SceneStore {
    pub fn new(marker_lifetime: Duration) -> Self {
        Self {
            snapshot: Arc::new(SceneSnapshot::default()),
            listeners: Rc::new(RefCell::new(Vec::new())),
            token_versions: HashMap::new(),
            marker_lifetime,
            dirty: false,
        }
    }

    pub fn get_snapshot(&self) -> Arc<SceneSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn subscribe(&self, listener: impl Fn(&Arc<SceneSnapshot>) + 'static) -> StoreSubscription {
        let listener: SnapshotListener = Rc::new(listener);
        self.listeners.borrow_mut().push(Rc::clone(&listener));
        StoreSubscription {
            listener,
            listeners: Rc::clone(&self.listeners),
        }
    }

    /// Returns whether a redraw was requested since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Applies one change. Returns false when the delta was dropped or changed
    /// nothing; listeners only hear about real changes.
    pub(crate) fn apply_delta(&mut self, delta: SceneDelta) -> bool {
        let mut next = (*self.snapshot).clone();
        let changed = self.apply_to(&mut next, delta);
        if changed {
            self.publish(next);
        }
        changed
    }

    /// Drops markers older than the display lifetime.
    pub fn expire_markers(&mut self, now: Instant) -> bool {
        let lifetime = self.marker_lifetime;
        let Some(scene) = self.snapshot.scene.as_ref() else {
            return false;
        };
        let is_live = |marker: &Marker| now.saturating_duration_since(marker.created_at) < lifetime;
        if scene.markers.iter().all(is_live) {
            return false;
        }
        let mut next = (*self.snapshot).clone();
        if let Some(scene) = next.scene.as_mut() {
            scene.markers.retain(is_live);
        }
        self.publish(next);
        true
    }

    /// Earliest instant at which a marker expires.
    pub fn next_marker_expiry(&self) -> Option<Instant> {
        self.snapshot
            .scene
            .as_ref()?
            .markers
            .iter()
            .map(|marker| marker.created_at + self.marker_lifetime)
            .min()
    }

    fn publish(&mut self, mut next: SceneSnapshot) {
        next.revision = self.snapshot.revision.wrapping_add(1);
        self.snapshot = Arc::new(next);
        self.dirty = true;
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            (listener)(&self.snapshot);
        }
    }

    fn apply_to(&mut self, next: &mut SceneSnapshot, delta: SceneDelta) -> bool {
        match delta {
            SceneDelta::ReplaceScene(scene) => self.replace_scene(next, scene),
            SceneDelta::ShareMedia(id) => {
                if next.shared_media.as_ref() == Some(&id) {
                    return false;
                }
                next.shared_media = Some(id);
                true
            }
            SceneDelta::DismissMedia => next.shared_media.take().is_some(),
            SceneDelta::AddMarker { id, x, y, created_at } => {
                let Some(scene) = next.scene.as_mut() else {
                    return false;
                };
                if scene.markers.iter().any(|marker| marker.id == id) {
                    return false;
                }
                scene.markers.push(Marker { id, x, y, created_at });
                true
            }
            delta => {
                let Some(scene) = next.scene.as_mut() else {
                    tracing::debug!(?delta, "no active scene; delta dropped");
                    return false;
                };
                self.apply_scene_delta(scene, delta)
            }
        }
    }

    fn replace_scene(&mut self, next: &mut SceneSnapshot, scene: Option<Scene>) -> bool {
        let Some(scene) = scene else {
            self.token_versions.clear();
            return next.scene.take().is_some();
        };
        let replacement = match next.scene.take() {
            Some(current) if current.id == scene.id => {
                let mut view = SceneView::from_scene(scene);
                view.tokens = view
                    .tokens
                    .into_iter()
                    .map(|entry| match current.token(&entry.token.id) {
                        Some(existing) => existing.reconcile(entry.token),
                        None => entry,
                    })
                    .collect();
                view.markers = current.markers;
                view.fog = current.fog;
                view.map_image = current.map_image;
                view
            }
            _ => {
                self.token_versions.clear();
                SceneView::from_scene(scene)
            }
        };
        next.scene = Some(replacement);
        true
    }

    fn apply_scene_delta(&mut self, scene: &mut SceneView, delta: SceneDelta) -> bool {
        let delta_scene = match &delta {
            SceneDelta::AddToken { scene_id, .. }
            | SceneDelta::UpdateToken { scene_id, .. }
            | SceneDelta::RemoveToken { scene_id, .. }
            | SceneDelta::LocalTokenEdit { scene_id, .. }
            | SceneDelta::TokenPersisted { scene_id, .. }
            | SceneDelta::TokenPersistFailed { scene_id, .. }
            | SceneDelta::ApplyFog { scene_id, .. }
            | SceneDelta::ApplyMap { scene_id, .. } => scene_id,
            _ => return false,
        };
        if delta_scene != &scene.id {
            tracing::debug!(
                active = %scene.id,
                scene_id = %delta_scene,
                "delta for inactive scene dropped"
            );
            return false;
        }

        match delta {
            SceneDelta::AddToken { token, version, .. } => {
                if !self.accept_version(&token.id, version) {
                    return false;
                }
                match scene.token_mut(&token.id) {
                    Some(existing) => {
                        let replacement = existing.reconcile(token);
                        if *existing == replacement {
                            return false;
                        }
                        *existing = replacement;
                    }
                    None => scene.tokens.push(TokenEntry::confirmed(token)),
                }
                true
            }
            SceneDelta::UpdateToken { patch, version, .. } => {
                let Some(entry) = scene.token_mut(&patch.id) else {
                    tracing::debug!(token_id = %patch.id, "update for unknown token dropped");
                    return false;
                };
                if !self.accept_version(&patch.id, version) {
                    return false;
                }
                apply_remote_patch(entry, &patch)
            }
            SceneDelta::RemoveToken {
                token_id, version, ..
            } => {
                if !self.accept_version(&token_id, version) {
                    return false;
                }
                let before = scene.tokens.len();
                scene.tokens.retain(|entry| entry.token.id != token_id);
                before != scene.tokens.len()
            }
            SceneDelta::LocalTokenEdit { patch, .. } => {
                let Some(entry) = scene.token_mut(&patch.id) else {
                    return false;
                };
                let mut expected = match &entry.sync {
                    TokenSync::Pending(expected) => expected.clone(),
                    TokenSync::Confirmed | TokenSync::Failed => TokenPatch::new(patch.id.clone()),
                };
                patch.merge_into(&mut entry.token);
                expected.absorb(patch);
                entry.sync = TokenSync::Pending(expected);
                true
            }
            SceneDelta::TokenPersisted { patch, .. } => {
                let Some(entry) = scene.token_mut(&patch.id) else {
                    return false;
                };
                let TokenSync::Pending(expected) = &entry.sync else {
                    return false;
                };
                let remaining = expected.without_matching(&patch);
                entry.sync = if remaining.is_empty() {
                    TokenSync::Confirmed
                } else {
                    TokenSync::Pending(remaining)
                };
                true
            }
            SceneDelta::TokenPersistFailed { token_id, .. } => {
                let Some(entry) = scene.token_mut(&token_id) else {
                    return false;
                };
                if entry.sync == TokenSync::Failed {
                    return false;
                }
                entry.sync = TokenSync::Failed;
                true
            }
            SceneDelta::ApplyFog { layer, .. } => {
                if scene.fog_version().is_some_and(|current| layer.version <= current) {
                    tracing::debug!(version = layer.version, "stale fog raster dropped");
                    return false;
                }
                scene.fog = Some(layer);
                true
            }
            SceneDelta::ApplyMap { layer, .. } => {
                if scene.map_version().is_some_and(|current| layer.version <= current) {
                    return false;
                }
                scene.map_image = Some(layer);
                true
            }
            _ => false,
        }
    }

    /// Versionless deltas always pass. Versioned ones must beat the last seen
    /// version for that token.
    fn accept_version(&mut self, token_id: &TokenId, version: Option<u64>) -> bool {
        let Some(version) = version else {
            return true;
        };
        match self.token_versions.get(token_id) {
            Some(seen) if version <= *seen => {
                tracing::debug!(%token_id, version, seen, "out-of-order token delta dropped");
                false
            }
            _ => {
                self.token_versions.insert(token_id.clone(), version);
                true
            }
        }
    }
}

fn apply_remote_patch(entry: &mut TokenEntry, patch: &TokenPatch) -> bool {
    match &entry.sync {
        TokenSync::Pending(expected) => {
            let rest = patch.without_fields_of(expected);
            let remaining = expected.without_matching(patch);
            let mut changed = rest.merge_into(&mut entry.token);
            let sync = if remaining.is_empty() {
                TokenSync::Confirmed
            } else {
                TokenSync::Pending(remaining)
            };
            if entry.sync != sync {
                entry.sync = sync;
                changed = true;
            }
            changed
        }
        TokenSync::Failed => {
            patch.merge_into(&mut entry.token);
            entry.sync = TokenSync::Confirmed;
            true
        }
        TokenSync::Confirmed => patch.merge_into(&mut entry.token),
    }
}
