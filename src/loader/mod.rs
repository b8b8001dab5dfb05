//! Cancellable scene image loads.
//!
//! Every [`ImageLoadManager::load`] call issues a fresh fetch; identical URLs
//! are never deduplicated. Whoever owns a resource slot cancels the previous
//! [`LoadTask`] before starting the next one. A cancelled task never yields a
//! result, even if its worker finishes afterwards.

mod fetch;
mod urls;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use thiserror::Error;

use crate::geometry::ImageBounds;

pub use fetch::{DirectoryFetcher, FetchError, FetchResult, ImageFetcher};
pub use urls::{CacheBuster, SceneUrls, UrlError};

const LOAD_WORKER_NAME: &str = "fogsync-image-load";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("failed to decode image from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: image::ImageError,
    },
    #[error("image from {url} has no pixels")]
    EmptyImage { url: String },
    #[error("failed to start load worker for {url}: {source}")]
    Spawn {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("load worker for {url} exited without a result")]
    WorkerLost { url: String },
}

pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// A fully decoded raster. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    url: String,
    pixels: Arc<RgbaImage>,
}

impl LoadedImage {
    pub fn new(url: impl Into<String>, pixels: RgbaImage) -> Self {
        Self {
            url: url.into(),
            pixels: Arc::new(pixels),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pixels(&self) -> &Arc<RgbaImage> {
        &self.pixels
    }

    pub fn bounds(&self) -> ImageBounds {
        ImageBounds::new(self.pixels.width(), self.pixels.height())
    }
}

impl PartialEq for LoadedImage {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

#[derive(Debug)]
pub enum LoadPoll {
    Pending,
    Ready(LoadResult<LoadedImage>),
    /// Cancelled, or the result was already taken.
    Closed,
}

#[derive(Debug)]
pub struct LoadTask {
    url: String,
    cancelled: Arc<AtomicBool>,
    receiver: mpsc::Receiver<LoadResult<LoadedImage>>,
    finished: bool,
}

impl LoadTask {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Suppresses any later result. Safe to call repeatedly.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::debug!(url = %self.url, "image load cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn poll(&mut self) -> LoadPoll {
        if self.finished || self.is_cancelled() {
            return LoadPoll::Closed;
        }
        match self.receiver.try_recv() {
            Ok(result) => self.finish(result),
            Err(mpsc::TryRecvError::Empty) => LoadPoll::Pending,
            Err(mpsc::TryRecvError::Disconnected) => self.lost(),
        }
    }

    /// Blocks up to `timeout` for the result. Intended for headless drivers.
    pub fn wait(&mut self, timeout: Duration) -> LoadPoll {
        if self.finished || self.is_cancelled() {
            return LoadPoll::Closed;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(_) if self.is_cancelled() => LoadPoll::Closed,
            Ok(result) => self.finish(result),
            Err(mpsc::RecvTimeoutError::Timeout) => LoadPoll::Pending,
            Err(mpsc::RecvTimeoutError::Disconnected) => self.lost(),
        }
    }

    fn finish(&mut self, result: LoadResult<LoadedImage>) -> LoadPoll {
        self.finished = true;
        LoadPoll::Ready(result)
    }

    fn lost(&mut self) -> LoadPoll {
        if self.is_cancelled() {
            return LoadPoll::Closed;
        }
        self.finish(Err(LoadError::WorkerLost {
            url: self.url.clone(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// One worker thread per load.
    #[default]
    Background,
    /// Fetch and decode on the calling thread during `load`.
    Inline,
}

#[derive(Clone)]
pub struct ImageLoadManager {
    fetcher: Arc<dyn ImageFetcher>,
    mode: LoadMode,
}

impl std::fmt::Debug for ImageLoadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoadManager")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ImageLoadManager {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self::with_mode(fetcher, LoadMode::Background)
    }

    pub fn inline(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self::with_mode(fetcher, LoadMode::Inline)
    }

    pub fn with_mode(fetcher: Arc<dyn ImageFetcher>, mode: LoadMode) -> Self {
        Self { fetcher, mode }
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    pub fn load(&self, url: impl Into<String>) -> LoadTask {
        let url = url.into();
        let cancelled = Arc::new(AtomicBool::new(false));
        tracing::debug!(url = %url, mode = ?self.mode, "image load started");

        let work = {
            let fetcher = Arc::clone(&self.fetcher);
            let cancelled = Arc::clone(&cancelled);
            let url = url.clone();
            move || fetch_and_decode(fetcher.as_ref(), &url, &cancelled)
        };

        let receiver = match self.mode {
            LoadMode::Inline => worker::run_inline(work),
            LoadMode::Background => match worker::spawn_worker(LOAD_WORKER_NAME, work) {
                Ok(receiver) => receiver,
                Err(source) => {
                    tracing::warn!(url = %url, ?source, "failed to spawn image load worker");
                    let (tx, rx) = mpsc::channel();
                    let _ = tx.send(Err(LoadError::Spawn {
                        url: url.clone(),
                        source,
                    }));
                    rx
                }
            },
        };

        LoadTask {
            url,
            cancelled,
            receiver,
            finished: false,
        }
    }
}

fn fetch_and_decode(
    fetcher: &dyn ImageFetcher,
    url: &str,
    cancelled: &AtomicBool,
) -> Option<LoadResult<LoadedImage>> {
    if cancelled.load(Ordering::SeqCst) {
        return None;
    }
    let bytes = match fetcher.fetch(url) {
        Ok(bytes) => bytes,
        Err(source) => {
            return Some(Err(LoadError::Fetch {
                url: url.to_string(),
                source,
            }))
        }
    };
    if cancelled.load(Ordering::SeqCst) {
        return None;
    }
    let decoded = match image::load_from_memory(&bytes) {
        Ok(decoded) => decoded.to_rgba8(),
        Err(source) => {
            return Some(Err(LoadError::Decode {
                url: url.to_string(),
                source,
            }))
        }
    };
    if decoded.width() == 0 || decoded.height() == 0 {
        return Some(Err(LoadError::EmptyImage {
            url: url.to_string(),
        }));
    }
    if cancelled.load(Ordering::SeqCst) {
        return None;
    }
    Some(Ok(LoadedImage::new(url, decoded)))
}
