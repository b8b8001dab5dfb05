//! Headless driver: replays channel frames from a reader through a
//! [`Session`] and logs what a renderer would see after each one.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use crate::config::SessionConfig;
use crate::error::AppResult;
use crate::loader::{DirectoryFetcher, ImageLoadManager, SceneUrls};
use crate::protocol::OutboundMessage;
use crate::scene::{Scene, SceneId, TokenId};
use crate::session::Session;
use crate::store::SceneSnapshot;
use crate::sync::{ApiError, ApiResult, ChannelResult, ChannelSink, SceneApi};

#[derive(Debug, Clone, Parser)]
#[command(name = "fogsync", version, about = "Replays scene channel frames read from stdin")]
pub struct ReplayArgs {
    /// Directory holding `map/<scene>/map` and `map/<scene>/fog-live` images.
    pub image_root: PathBuf,
    /// JSON scene served as the active scene on every resync.
    pub initial_scene: Option<PathBuf>,
}

impl ReplayArgs {
    pub fn into_options(self, config: SessionConfig) -> ReplayOptions {
        ReplayOptions {
            image_root: self.image_root,
            initial_scene: self.initial_scene,
            config,
        }
    }
}

/// Serves the active scene from a JSON file, re-read on every fetch, and
/// logs token PATCHes instead of sending them.
#[derive(Debug)]
pub struct ReplayApi {
    scene_file: Option<PathBuf>,
    urls: SceneUrls,
}

impl ReplayApi {
    pub fn new(scene_file: Option<PathBuf>, urls: SceneUrls) -> Self {
        Self { scene_file, urls }
    }
}

impl SceneApi for ReplayApi {
    fn fetch_active_scene(&self) -> ApiResult<Option<Scene>> {
        let Some(path) = self.scene_file.as_deref() else {
            return Ok(None);
        };
        tracing::debug!(
            route = %self.urls.active_scene_url(),
            path = %path.display(),
            "serving active scene from file"
        );
        read_scene_file(path).map(Some)
    }

    fn patch_token(
        &self,
        scene_id: &SceneId,
        token_id: &TokenId,
        body: serde_json::Value,
    ) -> ApiResult<()> {
        let route = self.urls.token_url(scene_id, token_id);
        if body.as_object().is_none_or(|fields| fields.is_empty()) {
            return Err(ApiError::Rejected { route, status: 400 });
        }
        tracing::info!(%route, %body, "token patch");
        Ok(())
    }
}

/// Logs outbound frames instead of sending them.
#[derive(Debug, Default)]
pub struct LogChannel;

impl ChannelSink for LogChannel {
    fn emit(&self, message: &OutboundMessage) -> ChannelResult<()> {
        let frame = message.to_json()?;
        tracing::info!(%frame, "outbound frame");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub image_root: PathBuf,
    pub initial_scene: Option<PathBuf>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub frames: usize,
    pub applied: usize,
    pub dropped: usize,
    pub revision: u64,
}

/// Reads and validates a scene file, reporting failures the way a scene
/// endpoint would.
pub fn read_scene_file(path: &Path) -> ApiResult<Scene> {
    let route = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|err| ApiError::Transport {
        route: route.clone(),
        message: err.to_string(),
    })?;
    let scene: Scene = serde_json::from_str(&raw).map_err(|source| ApiError::Decode {
        route: route.clone(),
        source,
    })?;
    if !scene.is_well_formed() {
        return Err(ApiError::InvalidScene { route });
    }
    Ok(scene)
}

pub fn build_session(options: &ReplayOptions) -> AppResult<Session> {
    if let Some(path) = options.initial_scene.as_deref() {
        read_scene_file(path)?;
    }
    let urls = SceneUrls::new(
        &options.config.api_base_url,
        options.config.authorization.clone(),
    )?;
    let fetcher = Arc::new(DirectoryFetcher::new(options.image_root.clone()));
    let session = Session::new(
        &options.config,
        Box::new(ReplayApi::new(options.initial_scene.clone(), urls)),
        Box::new(LogChannel),
        ImageLoadManager::inline(fetcher),
    )?;
    Ok(session)
}

/// Feeds every non-blank line of `input` to `session` as one channel frame.
pub fn replay<R: BufRead>(input: R, session: &mut Session) -> AppResult<ReplaySummary> {
    session.on_connected()?;
    session.tick(Instant::now());
    log_snapshot(&session.frame().snapshot);

    let mut summary = ReplaySummary::default();
    for line in input.lines() {
        let line = line?;
        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }
        summary.frames += 1;
        let now = Instant::now();
        if session.handle_inbound(frame, now) {
            summary.applied += 1;
        } else {
            summary.dropped += 1;
        }
        session.tick(now);
        for notice in session.take_notices() {
            tracing::warn!(?notice, "sync notice");
        }
        log_snapshot(&session.frame().snapshot);
    }
    summary.revision = session.frame().snapshot.revision;
    Ok(summary)
}

fn log_snapshot(snapshot: &SceneSnapshot) {
    let Some(scene) = snapshot.scene.as_ref() else {
        tracing::info!(revision = snapshot.revision, "idle: no active scene");
        return;
    };
    tracing::info!(
        revision = snapshot.revision,
        scene_id = %scene.id,
        tokens = scene.tokens.len(),
        markers = scene.markers.len(),
        fog_version = ?scene.fog_version(),
        map_version = ?scene.map_version(),
        shared_media = ?snapshot.shared_media,
        "scene"
    );
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn replay_counts_applied_and_dropped_frames() {
        let options = ReplayOptions {
            image_root: std::env::temp_dir().join("fogsync-replay-missing-images"),
            initial_scene: None,
            config: SessionConfig::default(),
        };
        let mut session = build_session(&options).expect("session should build");
        let input = Cursor::new(
            [
                r#"{"type":"scene-switched","payload":{"scene":{"id":"m1","tokens":[]}}}"#,
                "",
                "garbage",
                r#"{"type":"token-added","payload":{"sceneId":"m1","token":{"id":"t1","x":1,"y":2,"radius":3}}}"#,
                r#"{"type":"media-shared","payload":{"id":"note-1"}}"#,
            ]
            .join("\n"),
        );

        let summary = replay(input, &mut session).expect("replay should finish");
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.dropped, 1);

        let snapshot = session.frame().snapshot;
        let view = snapshot.scene.as_ref().expect("m1 should be active");
        assert_eq!(view.tokens.len(), 1);
        assert!(view.fog.is_none());
        assert_eq!(snapshot.shared_media.as_ref().map(|id| id.as_str()), Some("note-1"));
    }

    fn scene_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fogsync-replay-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir should exist");
        let path = dir.join(name);
        std::fs::write(&path, contents).expect("scene file should be written");
        path
    }

    #[test]
    fn missing_scene_file_is_a_transport_error() {
        let err = read_scene_file(Path::new("/nonexistent/fogsync/scene.json"))
            .expect_err("missing file should fail");
        assert!(matches!(err, ApiError::Transport { .. }));
    }

    #[test]
    fn unparsable_scene_file_is_a_decode_error() {
        let path = scene_file("broken.json", "{ not json");
        let err = read_scene_file(&path).expect_err("bad json should fail");
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[test]
    fn scene_file_with_blank_id_is_rejected_before_the_session_starts() {
        let path = scene_file("blank-id.json", r#"{"id":"  ","tokens":[]}"#);
        assert!(matches!(
            read_scene_file(&path),
            Err(ApiError::InvalidScene { .. })
        ));

        let options = ReplayOptions {
            image_root: std::env::temp_dir(),
            initial_scene: Some(path),
            config: SessionConfig::default(),
        };
        let err = build_session(&options).expect_err("invalid scene should stop startup");
        assert!(matches!(
            err,
            crate::error::AppError::Api(ApiError::InvalidScene { .. })
        ));
    }

    #[test]
    fn scene_file_is_served_on_resync() {
        let path = scene_file(
            "active.json",
            r#"{"id":"m7","tokens":[{"id":"t1","x":1,"y":2,"radius":3}]}"#,
        );
        let options = ReplayOptions {
            image_root: std::env::temp_dir().join("fogsync-replay-missing-images"),
            initial_scene: Some(path),
            config: SessionConfig::default(),
        };
        let mut session = build_session(&options).expect("session should build");
        let summary = replay(Cursor::new(""), &mut session).expect("replay should finish");
        assert_eq!(summary.frames, 0);
        let snapshot = session.frame().snapshot;
        assert_eq!(snapshot.scene_id().map(SceneId::as_str), Some("m7"));
    }

    #[test]
    fn empty_patch_body_is_rejected() {
        let urls = SceneUrls::new("/api", None).expect("path base should parse");
        let api = ReplayApi::new(None, urls);
        let scene_id = SceneId::from("m1");
        let token_id = TokenId::from("t1");

        assert!(api.fetch_active_scene().expect("no file means no scene").is_none());
        assert!(api
            .patch_token(&scene_id, &token_id, serde_json::json!({ "x": 1.0 }))
            .is_ok());
        match api.patch_token(&scene_id, &token_id, serde_json::json!({})) {
            Err(ApiError::Rejected { route, status }) => {
                assert_eq!(route, "/api/map/m1/token/t1");
                assert_eq!(status, 400);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn args_take_image_root_and_optional_scene() {
        let args = ReplayArgs::try_parse_from(["fogsync", "/srv/images", "scene.json"])
            .expect("both positionals should parse");
        assert_eq!(args.image_root, PathBuf::from("/srv/images"));
        assert_eq!(args.initial_scene, Some(PathBuf::from("scene.json")));

        let options = ReplayArgs::try_parse_from(["fogsync", "/srv/images"])
            .expect("scene is optional")
            .into_options(SessionConfig::default());
        assert!(options.initial_scene.is_none());

        assert!(ReplayArgs::try_parse_from(["fogsync"]).is_err());
    }
}
