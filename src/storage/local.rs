//! `StoragePort` over the local (or locally mounted) filesystem.

use super::{path_to_url, url_to_path, StoragePort};
use crate::error::{ProxyError, ProxyResult};
use crate::model::FileSelector;
use async_trait::async_trait;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Storage adapter for `file:` URLs and plain paths.
#[derive(Debug, Clone, Default)]
pub struct LocalFileStorage;

impl LocalFileStorage {
    pub fn new() -> Self {
        Self
    }

    fn absolute(url: &str) -> ProxyResult<PathBuf> {
        let path = url_to_path(url)?;
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }
}

/// Copy the selected files of `source` into `destination`, blocking.
fn copy_tree(source: &Path, destination: &Path, selector: &FileSelector) -> ProxyResult<usize> {
    if !source.is_dir() {
        return Err(ProxyError::Storage(format!(
            "source folder {} does not exist",
            source.display()
        )));
    }
    let compiled = selector.compile()?;
    std::fs::create_dir_all(destination)?;

    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("encountered error when enumerating {}: {}", source.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        if !compiled.is_selected(&relative_str) {
            continue;
        }
        let target = destination.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &target).map_err(|e| {
            ProxyError::Storage(format!(
                "failed to copy {} to {}: {}",
                entry.path().display(),
                target.display(),
                e
            ))
        })?;
        debug!("Copied {}", relative_str);
        copied += 1;
    }
    Ok(copied)
}

#[async_trait]
impl StoragePort for LocalFileStorage {
    async fn resolve(&self, url: &str) -> ProxyResult<String> {
        Ok(path_to_url(&Self::absolute(url)?))
    }

    async fn create_folder(&self, url: &str) -> ProxyResult<()> {
        let path = Self::absolute(url)?;
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            ProxyError::Storage(format!("failed to create folder {}: {}", path.display(), e))
        })
    }

    async fn copy(
        &self,
        source: &str,
        destination: &str,
        selector: &FileSelector,
    ) -> ProxyResult<usize> {
        let source = Self::absolute(source)?;
        let destination = Self::absolute(destination)?;
        let selector = selector.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &destination, &selector))
            .await
            .map_err(|e| ProxyError::Transfer(format!("copy task failed: {}", e)))?
    }

    async fn delete(&self, url: &str) -> ProxyResult<()> {
        let path = Self::absolute(url)?;
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| {
            ProxyError::Storage(format!("failed to delete {}: {}", path.display(), e))
        })
    }
}
