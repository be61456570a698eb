// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire types for the tracking server API.

use serde::{Deserialize, Serialize};

/// Where the viewer is within a show.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchStatus {
    /// Index of the episode being watched.
    #[serde(default)]
    pub watched_episode: u32,
    /// Playback position within that episode, in seconds.
    #[serde(default)]
    pub watched_episode_time: f64,
    #[serde(default)]
    pub watched_episode_time_ratio: f64,
}

impl WatchStatus {
    /// Watch state positioned at the start of `episode`.
    pub fn at_episode(episode: u32) -> Self {
        Self {
            watched_episode: episode,
            ..Self::default()
        }
    }
}

/// One show in the monitor summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvSummary {
    pub id: u64,
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub watch: WatchStatus,
    #[serde(default)]
    pub total_episodes: u32,
    #[serde(default)]
    pub icon_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRequest {
    pub version: String,
}

/// Summary of every tracked show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorResponse {
    pub is_new: bool,
    pub version: String,
    #[serde(default)]
    pub tvs: Vec<TvSummary>,
    #[serde(default)]
    pub critical_errors: u32,
    #[serde(default)]
    pub errors: u32,
}

impl MonitorResponse {
    /// Served while offline when no snapshot summary is available.
    pub fn offline_placeholder() -> Self {
        Self {
            is_new: false,
            version: "offline".to_string(),
            tvs: Vec::new(),
            critical_errors: 0,
            errors: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    pub tag: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMonitorEntry {
    pub key: String,
    pub name: String,
}

/// Server-side display configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigResponse {
    /// Ratio after which an episode counts as watched.
    pub watched_ratio: f64,
    #[serde(default)]
    pub tags: Vec<TagConfig>,
    #[serde(default)]
    pub system_monitor: Vec<SystemMonitorEntry>,
}

impl ConfigResponse {
    pub fn offline_placeholder() -> Self {
        Self {
            watched_ratio: 0.9,
            tags: vec![
                TagConfig {
                    tag: "watching".to_string(),
                    name: "Watching".to_string(),
                },
                TagConfig {
                    tag: "finished".to_string(),
                    name: "Finished".to_string(),
                },
            ],
            system_monitor: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTvRequest {
    pub id: u64,
}

/// Full detail for one show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvDetail {
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub watch: WatchStatus,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

impl TvDetail {
    pub fn offline_placeholder() -> Self {
        Self {
            name: "Offline TV Show".to_string(),
            tag: "watching".to_string(),
            watch: WatchStatus::default(),
            episodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetWatchRequest {
    pub id: u64,
    pub watch: WatchStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTvRequest {
    pub keyword: String,
}

/// A candidate source returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_key: String,
    pub name: String,
    pub channel_name: String,
    pub url: String,
    #[serde(default)]
    pub cover_url: String,
    #[serde(default)]
    pub tracking: bool,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTvResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub source: Vec<Source>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTvRequest {
    pub name: String,
    pub source: Source,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTvResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub id: u64,
}
