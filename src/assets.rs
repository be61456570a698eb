// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Content-addressed image cache.
//!
//! Images are stored as `<dir>/<sha256(url)>.jpg`. Entries are never evicted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::transfer::{TransferError, Transport};

#[derive(Clone)]
pub struct ImageCache {
    dir: PathBuf,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> Self {
        Self {
            dir: dir.into(),
            transport,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the image for `url` lives, whether or not it is cached yet.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        self.dir.join(format!("{}.jpg", hex::encode(hasher.finalize())))
    }

    /// Path of the cached image, if present.
    pub fn cached(&self, url: &str) -> Option<PathBuf> {
        let path = self.cache_path(url);
        path.is_file().then_some(path)
    }

    /// Return the cached image, downloading it first if needed.
    ///
    /// Failures are logged and yield `None`.
    pub async fn fetch(&self, url: &str) -> Option<PathBuf> {
        if let Some(path) = self.cached(url) {
            return Some(path);
        }
        let path = self.cache_path(url);
        match self.download(url, &path).await {
            Ok(()) => {
                tracing::debug!(url, path = %path.display(), "cached image");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "failed to cache image");
                None
            }
        }
    }

    async fn download(&self, url: &str, path: &Path) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let temp_path = path.with_extension("part");

        let result: Result<(), TransferError> = async {
            let body = self.transport.open(url, 0).await?;
            let mut file = tokio::fs::File::create(&temp_path).await?;
            let mut stream = body.stream;
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
            tokio::fs::rename(&temp_path, path).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result
    }
}
