// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use tvtrack::api::types::{
    AddTvRequest, AddTvResponse, ConfigResponse, Episode, MonitorResponse, SearchTvResponse,
    SetWatchRequest, TvDetail, TvSummary, WatchStatus,
};
use tvtrack::api::{ApiError, RemoteApi};
use tvtrack::download::{ItemKey, TransferItem};

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out waiting for the queue")
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Deterministic episode body.
pub fn episode_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn finished_item(show_id: u64, episode: u32) -> TransferItem {
    let mut item = TransferItem::new(
        ItemKey::new(show_id, episode),
        format!("http://server/{}/{}.mp4", show_id, episode),
        format!("{}-{}.mp4", show_id, episode),
    );
    item.begin().unwrap();
    item.finish(PathBuf::from(format!("/media/{}-{}.mp4", show_id, episode)))
        .unwrap();
    item
}

pub fn paused_item(show_id: u64, episode: u32) -> TransferItem {
    let mut item = TransferItem::new(
        ItemKey::new(show_id, episode),
        format!("http://server/{}/{}.mp4", show_id, episode),
        format!("{}-{}.mp4", show_id, episode),
    );
    item.pause().unwrap();
    item
}

/// In-process stand-in for the tracking server.
#[derive(Default)]
pub struct FakeApi {
    shows: Vec<u64>,
    unreachable: AtomicBool,
    rejected_watch: Mutex<HashSet<u64>>,
    pushes_held: AtomicBool,
    pushes_released: Notify,
    pub fetched_details: Mutex<Vec<u64>>,
    pub pushed: Mutex<Vec<SetWatchRequest>>,
}

impl FakeApi {
    pub fn with_shows(shows: &[u64]) -> Self {
        Self {
            shows: shows.to_vec(),
            ..Self::default()
        }
    }

    /// Make every call fail with a network error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make `set_watch` for `id` fail.
    pub fn reject_watch(&self, id: u64) {
        self.rejected_watch.lock().unwrap().insert(id);
    }

    /// Make `set_watch` wait after recording its request until released.
    pub fn hold_pushes(&self) {
        self.pushes_held.store(true, Ordering::SeqCst);
    }

    pub fn release_pushes(&self) {
        self.pushes_held.store(false, Ordering::SeqCst);
        self.pushes_released.notify_waiters();
    }

    pub fn pushed_ids(&self) -> Vec<u64> {
        self.pushed.lock().unwrap().iter().map(|r| r.id).collect()
    }

    fn check(&self) -> Result<(), ApiError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(ApiError::Network("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn detail(id: u64) -> TvDetail {
        TvDetail {
            name: format!("Show {}", id),
            tag: "watching".to_string(),
            watch: WatchStatus::at_episode(1),
            episodes: (0..4)
                .map(|i| Episode {
                    name: format!("Episode {}", i + 1),
                    url: format!("/media/{}/{}.mp4", id, i),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn fetch_monitor(&self, _version: &str) -> Result<MonitorResponse, ApiError> {
        self.check()?;
        Ok(MonitorResponse {
            is_new: true,
            version: "v1".to_string(),
            tvs: self
                .shows
                .iter()
                .map(|&id| TvSummary {
                    id,
                    name: format!("Show {}", id),
                    tag: "watching".to_string(),
                    watch: WatchStatus::at_episode(1),
                    total_episodes: 4,
                    icon_url: format!("/img/{}.jpg", id),
                })
                .collect(),
            critical_errors: 0,
            errors: 0,
        })
    }

    async fn fetch_config(&self) -> Result<ConfigResponse, ApiError> {
        self.check()?;
        Ok(ConfigResponse {
            watched_ratio: 0.8,
            tags: Vec::new(),
            system_monitor: Vec::new(),
        })
    }

    async fn fetch_tv(&self, id: u64) -> Result<TvDetail, ApiError> {
        self.check()?;
        self.fetched_details.lock().unwrap().push(id);
        Ok(Self::detail(id))
    }

    async fn set_watch(&self, request: &SetWatchRequest) -> Result<(), ApiError> {
        self.check()?;
        self.pushed.lock().unwrap().push(request.clone());
        loop {
            let released = self.pushes_released.notified();
            if !self.pushes_held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        if self.rejected_watch.lock().unwrap().contains(&request.id) {
            return Err(ApiError::Status {
                status: 500,
                body: "database locked".to_string(),
            });
        }
        Ok(())
    }

    async fn search_tv(&self, _keyword: &str) -> Result<SearchTvResponse, ApiError> {
        self.check()?;
        Ok(SearchTvResponse {
            error: None,
            source: Vec::new(),
        })
    }

    async fn add_tv(&self, _request: &AddTvRequest) -> Result<AddTvResponse, ApiError> {
        self.check()?;
        Ok(AddTvResponse { error: None, id: 99 })
    }
}
