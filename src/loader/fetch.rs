use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use thiserror::Error;

use super::urls::parse_lenient;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read image file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("url cannot be resolved to a local file: {url}")]
    UnresolvableUrl { url: String },
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Raw byte source for scene images. Implementations are called from load
/// worker threads.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> FetchResult<Vec<u8>>;
}

/// Resolves the path portion of an image URL against a local directory.
/// Query strings are ignored; a path without an extension also matches the
/// same name with `.png` appended.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, url: &str) -> FetchResult<PathBuf> {
        let unresolvable = || FetchError::UnresolvableUrl {
            url: url.to_string(),
        };
        let (parsed, _) = parse_lenient(url).map_err(|_| unresolvable())?;
        let segments = parsed.path_segments().ok_or_else(unresolvable)?;

        let mut path = self.root.clone();
        let mut pushed = 0;
        for segment in segments.filter(|segment| !segment.is_empty()) {
            let decoded = percent_decode_str(segment)
                .decode_utf8()
                .map_err(|_| unresolvable())?;
            if decoded == "." || decoded == ".." || decoded.contains(['/', '\\']) {
                return Err(unresolvable());
            }
            path.push(&*decoded);
            pushed += 1;
        }
        if pushed == 0 {
            return Err(unresolvable());
        }
        if !path.exists() && path.extension().is_none() {
            path.set_extension("png");
        }
        Ok(path)
    }
}

impl ImageFetcher for DirectoryFetcher {
    fn fetch(&self, url: &str) -> FetchResult<Vec<u8>> {
        let path = self.resolve(url)?;
        fs::read(&path).map_err(|source| FetchError::ReadFile { path, source })
    }
}
