// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote tracking server API.
//!
//! [`RemoteApi`] is the seam the offline reconciler talks through;
//! [`HttpApi`] is the production implementation.
//!
//! ```no_run
//! use tvtrack::api::{HttpApi, RemoteApi};
//! use tvtrack::config::ClientConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let api = HttpApi::new(&ClientConfig::load()?)?;
//! let monitor = api.fetch_monitor("").await?;
//! println!("{} shows", monitor.tvs.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod types;

use async_trait::async_trait;

pub use client::HttpApi;
pub use types::{
    AddTvRequest, AddTvResponse, ConfigResponse, Episode, MonitorResponse, SearchTvResponse,
    SetWatchRequest, Source, TvDetail, TvSummary, WatchStatus,
};

/// Errors from the remote API.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    /// The operation needs the server but offline mode is active.
    Offline,
    /// The request never produced a response.
    Network(String),
    /// Non-success HTTP status.
    Status { status: u16, body: String },
    /// The response body could not be decoded.
    Decode(String),
    /// The server answered with an `error` field.
    Server(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "Not available in offline mode"),
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Status { status, body } => {
                write!(f, "API request failed with status {}: {}", status, body)
            }
            Self::Decode(msg) => write!(f, "Invalid API response: {}", msg),
            Self::Server(msg) => write!(f, "Server error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

/// Operations offered by the tracking server.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn fetch_monitor(&self, version: &str) -> Result<MonitorResponse, ApiError>;
    async fn fetch_config(&self) -> Result<ConfigResponse, ApiError>;
    async fn fetch_tv(&self, id: u64) -> Result<TvDetail, ApiError>;
    async fn set_watch(&self, request: &SetWatchRequest) -> Result<(), ApiError>;
    async fn search_tv(&self, keyword: &str) -> Result<SearchTvResponse, ApiError>;
    async fn add_tv(&self, request: &AddTvRequest) -> Result<AddTvResponse, ApiError>;
}
