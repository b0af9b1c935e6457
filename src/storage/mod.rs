//! Boundary to the storage/transport layer.
//!
//! Locations are URL strings. Scratch folders live on shared storage that the
//! client reaches through a push/pull URL and compute nodes through the job's
//! input/output space URL.

pub mod local;

pub use local::LocalFileStorage;

use crate::constants::FILE_SCHEME_PREFIX;
use crate::error::{ProxyError, ProxyResult};
use crate::model::FileSelector;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// File-tree operations on URL-addressed locations.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Canonical URL of a location; the location does not need to exist
    async fn resolve(&self, url: &str) -> ProxyResult<String>;

    /// Create a folder and any missing parents
    async fn create_folder(&self, url: &str) -> ProxyResult<()>;

    /// Recursively copy the files of `source` selected by `selector` into
    /// `destination`, preserving relative paths. Returns the number of files copied.
    async fn copy(
        &self,
        source: &str,
        destination: &str,
        selector: &FileSelector,
    ) -> ProxyResult<usize>;

    /// Recursively delete a location. Deleting a missing location succeeds.
    async fn delete(&self, url: &str) -> ProxyResult<()>;

    fn parent(&self, url: &str) -> Option<String> {
        parent_url(url)
    }
}

/// Append a path segment to a URL
pub fn join_url(base: &str, segment: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        segment.trim_start_matches('/')
    )
}

/// URL one directory level up, `None` at a root
pub fn parent_url(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let parent = &trimmed[..idx];
    if parent.is_empty() || parent.ends_with('/') || parent.ends_with(':') {
        return None;
    }
    Some(parent.to_string())
}

/// URL of a local filesystem path
pub fn path_to_url(path: &Path) -> String {
    let display = path.to_string_lossy().replace('\\', "/");
    if display.starts_with('/') {
        format!("file://{}", display)
    } else {
        format!("file:///{}", display)
    }
}

/// Local path addressed by a `file:` URL or a plain path
pub fn url_to_path(url: &str) -> ProxyResult<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(rest));
    }
    if let Some(rest) = url.strip_prefix(FILE_SCHEME_PREFIX) {
        return Ok(PathBuf::from(rest));
    }
    if url.contains("://") {
        return Err(ProxyError::Storage(format!(
            "unsupported URL scheme for local storage: {}",
            url
        )));
    }
    Ok(PathBuf::from(url))
}
