//! Fetch collaborator interface
//!
//! The engine never performs I/O itself. A [`Fetcher`] turns a resource
//! identifier into a status code and, on success, a source the decoder can
//! read.

use pixcache_cache::StatusCode;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

/// Where a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchSource {
    /// Served from the in-memory tiers
    Memory,
    /// Read from local storage
    File,
    /// Downloaded
    Network,
}

/// Raw image data as produced by a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Encoded bytes held in memory
    Bytes(Vec<u8>),
    /// Encoded image stored on disk
    File(PathBuf),
}

/// The result of one fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub source: Option<ImageSource>,
    pub origin: FetchSource,
}

impl FetchResponse {
    /// A successful fetch
    pub fn ok(source: ImageSource, origin: FetchSource) -> Self {
        Self {
            status: StatusCode::OK,
            source: Some(source),
            origin,
        }
    }

    /// A fetch that produced no usable payload
    pub fn failed(status: StatusCode, origin: FetchSource) -> Self {
        Self {
            status,
            source: None,
            origin,
        }
    }
}

/// Raw-bytes fetch collaborator.
///
/// Implementations may block; the engine always calls them outside of its
/// locks. Closures with the matching signature implement the trait.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, resource: &str) -> FetchResponse;
}

impl<F> Fetcher for F
where
    F: Fn(&str) -> FetchResponse + Send + Sync,
{
    fn fetch(&self, resource: &str) -> FetchResponse {
        self(resource)
    }
}

/// Serves resources from files below a root directory.
///
/// Identifiers are relative paths. Anything that would escape the root, or
/// that does not name a regular file, yields `404`.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, resource: &str) -> Option<PathBuf> {
        let relative = Path::new(resource);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if resource.is_empty() || escapes {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, resource: &str) -> FetchResponse {
        match self.resolve(resource) {
            Some(path) if path.is_file() => {
                FetchResponse::ok(ImageSource::File(path), FetchSource::File)
            }
            _ => FetchResponse::failed(StatusCode::NOT_FOUND, FetchSource::File),
        }
    }
}
