// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client configuration.
//!
//! Loaded from `~/.tvtrack/config.json` when present, then overridden by
//! `TVTRACK_BASE_URL`, `TVTRACK_AUTH` and `TVTRACK_DATA_DIR`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default number of transfers allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 5;

const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server root; relative episode URLs are resolved against it.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Value sent verbatim in the `Authorization` header.
    #[serde(default)]
    pub auth_header: Option<String>,
    /// Where state files, downloads and cached images live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    /// Timeout for API calls. Transfers are not bounded by it.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".tvtrack"))
        .unwrap_or_else(|| PathBuf::from(".tvtrack"))
}

fn default_max_concurrent_transfers() -> usize {
    DEFAULT_MAX_CONCURRENT_TRANSFERS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_header: None,
            data_dir: default_data_dir(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Path of the config file.
    pub fn config_path() -> PathBuf {
        default_data_dir().join("config.json")
    }

    /// Load the config file (defaults if absent) and apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file {:?}", path))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config.normalized())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("TVTRACK_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(auth) = std::env::var("TVTRACK_AUTH") {
            self.auth_header = Some(auth);
        }
        if let Ok(dir) = std::env::var("TVTRACK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    fn normalized(mut self) -> Self {
        while self.base_url.ends_with('/') {
            self.base_url.pop();
        }
        if self.max_concurrent_transfers == 0 {
            tracing::warn!("max_concurrent_transfers was 0; using 1");
            self.max_concurrent_transfers = 1;
        }
        self
    }

    /// Directory holding the queue and offline state blobs.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Directory episode files are downloaded into.
    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    /// Directory of the content-addressed image cache.
    pub fn image_cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("images")
    }

    /// Absolute URLs pass through; anything else is joined onto `base_url`.
    pub fn resolve_url(&self, url: &str) -> String {
        resolve_url(&self.base_url, url)
    }
}

/// Join a possibly relative `url` onto `base_url`.
pub fn resolve_url(base_url: &str, url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if url.starts_with('/') {
        format!("{}{}", base_url, url)
    } else {
        format!("{}/{}", base_url, url)
    }
}
