use thiserror::Error;
use url::{Position, Url};

use crate::scene::{SceneId, TokenId};

/// Stand-in origin that lets path-only bases go through [`Url`].
const RELATIVE_ORIGIN: &str = "http://relative.invalid/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("invalid url {raw:?}: {source}")]
    Parse {
        raw: String,
        #[source]
        source: url::ParseError,
    },
    #[error("url {raw:?} cannot carry a path")]
    CannotBeABase { raw: String },
}

/// Parses an absolute url, or a path resolved against [`RELATIVE_ORIGIN`].
/// The flag is true for the latter.
pub(super) fn parse_lenient(raw: &str) -> Result<(Url, bool), UrlError> {
    let parse_error = |source| UrlError::Parse {
        raw: raw.to_string(),
        source,
    };
    let (url, relative) = match Url::parse(raw) {
        Ok(url) => (url, false),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let origin = Url::parse(RELATIVE_ORIGIN).map_err(parse_error)?;
            (origin.join(raw).map_err(parse_error)?, true)
        }
        Err(source) => return Err(parse_error(source)),
    };
    if url.cannot_be_a_base() {
        return Err(UrlError::CannotBeABase {
            raw: raw.to_string(),
        });
    }
    Ok((url, relative))
}

/// Builds authorized, cache-busted image URLs for a scene. A path-only base
/// (including the empty one) yields path-only URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneUrls {
    base: Url,
    relative: bool,
    authorization: Option<String>,
}

impl SceneUrls {
    pub fn new(base_url: &str, authorization: Option<String>) -> Result<Self, UrlError> {
        let (mut base, relative) = parse_lenient(base_url)?;
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self {
            base,
            relative,
            authorization,
        })
    }

    pub fn fog_url(&self, scene_id: &SceneId, cache_buster: u64) -> String {
        self.image_url(scene_id, "fog-live", cache_buster)
    }

    pub fn map_url(&self, scene_id: &SceneId, resource_version: u64) -> String {
        self.image_url(scene_id, "map", resource_version)
    }

    /// Route serving the currently active scene.
    pub fn active_scene_url(&self) -> String {
        self.render(self.resource(&["active-map"]))
    }

    /// Route of the token PATCH request.
    pub fn token_url(&self, scene_id: &SceneId, token_id: &TokenId) -> String {
        let url = self.resource(&["map", scene_id.as_str(), "token", token_id.as_str()]);
        self.render(url)
    }

    fn image_url(&self, scene_id: &SceneId, resource: &str, cache_buster: u64) -> String {
        let mut url = self.resource(&["map", scene_id.as_str(), resource]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("cache_buster", &cache_buster.to_string());
            if let Some(token) = self.authorization.as_deref() {
                query.append_pair("authorization", token);
            }
        }
        self.render(url)
    }

    fn resource(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // `new` rejected cannot-be-a-base urls, so the segments are always there.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn render(&self, url: Url) -> String {
        if self.relative {
            url[Position::BeforePath..].to_string()
        } else {
            url.into()
        }
    }
}

/// Monotonic per-slot counter appended to image URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheBuster {
    next: u64,
}

impl CacheBuster {
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next_value(&mut self) -> u64 {
        let value = self.next;
        self.next = self.next.saturating_add(1);
        value
    }

    pub const fn peek(&self) -> u64 {
        self.next
    }
}
