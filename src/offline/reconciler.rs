// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline-aware front for the remote API.
//!
//! Online, every call goes to the server. Offline, reads are answered from
//! the snapshot taken when offline mode was entered and watch updates are
//! recorded locally, then pushed when offline mode is left. Pushes that fail
//! are dropped along with the snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::api::types::{
    AddTvRequest, AddTvResponse, ConfigResponse, MonitorResponse, SearchTvResponse,
    SetWatchRequest, TvDetail,
};
use crate::api::{ApiError, RemoteApi};
use crate::download::TransferItem;
use crate::library::offline_eligible_shows;
use crate::locks::{resilient_read, resilient_write};
use crate::observe::{Observers, Subscription};
use crate::store::BlobStore;

use super::snapshot::{load_state, restrict_monitor, save_state, OfflineSnapshot};

/// Outcome of replaying offline watch updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: Vec<u64>,
    /// Shows whose update did not reach the server. They are not retried.
    pub failed: Vec<u64>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ReconcilerState {
    offline: bool,
    /// Present exactly while offline.
    snapshot: Option<OfflineSnapshot>,
    seq: u64,
}

struct Inner {
    api: Arc<dyn RemoteApi>,
    store: Arc<dyn BlobStore>,
    state: RwLock<ReconcilerState>,
    observers: Observers<bool>,
    transition: tokio::sync::Mutex<()>,
}

/// Offline cache and sync engine. Clones share state.
#[derive(Clone)]
pub struct OfflineReconciler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OfflineReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineReconciler")
            .field("offline", &self.is_offline())
            .finish_non_exhaustive()
    }
}

impl OfflineReconciler {
    /// Restore the persisted mode. Offline mode survives a restart.
    pub fn open(api: Arc<dyn RemoteApi>, store: Arc<dyn BlobStore>) -> Self {
        let (offline, snapshot) = match load_state(store.as_ref()) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "failed to load offline state, starting online");
                (false, None)
            }
        };
        let snapshot = if offline {
            Some(snapshot.unwrap_or_else(OfflineSnapshot::empty))
        } else {
            None
        };
        if offline {
            tracing::info!("restored offline mode");
        }

        Self {
            inner: Arc::new(Inner {
                api,
                store,
                state: RwLock::new(ReconcilerState {
                    offline,
                    snapshot,
                    seq: 0,
                }),
                observers: Observers::new(offline),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn is_offline(&self) -> bool {
        resilient_read(&self.inner.state).offline
    }

    /// Register `listener` for mode changes; it is called now with the current mode.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(move |offline: &bool| listener(*offline))
    }

    /// Copy of the current snapshot, if offline.
    pub fn snapshot(&self) -> Option<OfflineSnapshot> {
        resilient_read(&self.inner.state).snapshot.clone()
    }

    /// Snapshot server state for shows with a finished download and go offline.
    ///
    /// Fetch failures are logged; offline mode is entered with whatever was
    /// obtained.
    pub async fn enter_offline_mode(&self, items: &[TransferItem]) {
        let _transition = self.inner.transition.lock().await;
        if self.is_offline() {
            tracing::debug!("already offline");
            return;
        }

        let eligible = offline_eligible_shows(items);
        let api = &self.inner.api;

        let monitor = match api.fetch_monitor("").await {
            Ok(monitor) => Some(restrict_monitor(monitor, &eligible)),
            Err(e) => {
                tracing::warn!(error = %e, "could not fetch monitor for offline snapshot");
                None
            }
        };
        let config = match api.fetch_config().await {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(error = %e, "could not fetch config for offline snapshot");
                None
            }
        };

        let retained: Vec<u64> = match &monitor {
            Some(monitor) => monitor.tvs.iter().map(|tv| tv.id).collect(),
            None => eligible.iter().copied().collect(),
        };
        let mut details = BTreeMap::new();
        for id in retained {
            match api.fetch_tv(id).await {
                Ok(detail) => {
                    details.insert(id, detail);
                }
                Err(e) => tracing::warn!(id, error = %e, "could not fetch show detail for offline snapshot"),
            }
        }

        let mut snapshot = OfflineSnapshot::new(monitor, config);
        snapshot.details = details;
        tracing::info!(shows = snapshot.details.len(), "entering offline mode");
        self.set_mode(true, Some(snapshot));
    }

    /// Push offline watch updates, then drop the snapshot and go online.
    ///
    /// Every pending show is attempted once per recorded state. Writes made
    /// while the pushes are in flight are pushed too; the switch to online
    /// happens under the same lock as the final check, so no write lands in
    /// a snapshot about to be dropped. Failed pushes are logged and reported
    /// but not kept.
    pub async fn leave_offline_mode(&self) -> SyncReport {
        let _transition = self.inner.transition.lock().await;
        if !self.is_offline() {
            tracing::debug!("already online");
            return SyncReport::default();
        }

        let mut attempted: HashMap<u64, SetWatchRequest> = HashMap::new();
        let mut report = SyncReport::default();
        let seq = loop {
            let batch = {
                let mut state = resilient_write(&self.inner.state);
                let batch = state
                    .snapshot
                    .as_ref()
                    .map(|s| unsynced(s, &attempted))
                    .unwrap_or_default();
                if batch.is_empty() {
                    state.offline = false;
                    state.snapshot = None;
                    self.persist(&state);
                    state.seq += 1;
                    break state.seq;
                }
                batch
            };

            for request in batch {
                let id = request.id;
                report.pushed.retain(|&p| p != id);
                report.failed.retain(|&f| f != id);
                match self.inner.api.set_watch(&request).await {
                    Ok(()) => report.pushed.push(id),
                    Err(e) => {
                        tracing::warn!(id, error = %e, "failed to sync watch state, dropping it");
                        report.failed.push(id);
                    }
                }
                attempted.insert(id, request);
            }
        };

        tracing::info!(
            pushed = report.pushed.len(),
            failed = report.failed.len(),
            "left offline mode"
        );
        self.inner.observers.publish(seq, false);
        report
    }

    /// Enter offline mode if online, otherwise leave it.
    ///
    /// Returns the sync report when offline mode was left.
    pub async fn toggle_offline_mode(&self, items: &[TransferItem]) -> Option<SyncReport> {
        if self.is_offline() {
            Some(self.leave_offline_mode().await)
        } else {
            self.enter_offline_mode(items).await;
            None
        }
    }

    pub async fn fetch_monitor(&self, version: &str) -> Result<MonitorResponse, ApiError> {
        if let Some(monitor) = self.read_offline(OfflineSnapshot::monitor_or_placeholder) {
            return Ok(monitor);
        }
        self.inner.api.fetch_monitor(version).await
    }

    pub async fn fetch_config(&self) -> Result<ConfigResponse, ApiError> {
        if let Some(config) = self.read_offline(OfflineSnapshot::config_or_placeholder) {
            return Ok(config);
        }
        self.inner.api.fetch_config().await
    }

    pub async fn fetch_tv(&self, id: u64) -> Result<TvDetail, ApiError> {
        if let Some(detail) = self.read_offline(|s| s.detail_or_placeholder(id)) {
            return Ok(detail);
        }
        self.inner.api.fetch_tv(id).await
    }

    /// Offline the update is recorded locally for later sync.
    pub async fn set_watch(&self, request: &SetWatchRequest) -> Result<(), ApiError> {
        if self.record_offline_watch(request) {
            return Ok(());
        }
        self.inner.api.set_watch(request).await
    }

    pub async fn search_tv(&self, keyword: &str) -> Result<SearchTvResponse, ApiError> {
        if self.is_offline() {
            return Err(ApiError::Offline);
        }
        self.inner.api.search_tv(keyword).await
    }

    pub async fn add_tv(&self, request: &AddTvRequest) -> Result<AddTvResponse, ApiError> {
        if self.is_offline() {
            return Err(ApiError::Offline);
        }
        self.inner.api.add_tv(request).await
    }

    fn read_offline<R>(&self, read: impl FnOnce(&OfflineSnapshot) -> R) -> Option<R> {
        let state = resilient_read(&self.inner.state);
        if !state.offline {
            return None;
        }
        state.snapshot.as_ref().map(read)
    }

    fn record_offline_watch(&self, request: &SetWatchRequest) -> bool {
        let mut state = resilient_write(&self.inner.state);
        if !state.offline {
            return false;
        }
        let snapshot = state.snapshot.get_or_insert_with(OfflineSnapshot::empty);
        snapshot.record_watch(request.id, request.watch.clone());
        tracing::debug!(id = request.id, "recorded offline watch update");
        self.persist(&state);
        true
    }

    fn set_mode(&self, offline: bool, snapshot: Option<OfflineSnapshot>) {
        let seq = {
            let mut state = resilient_write(&self.inner.state);
            state.offline = offline;
            state.snapshot = snapshot;
            self.persist(&state);
            state.seq += 1;
            state.seq
        };
        self.inner.observers.publish(seq, offline);
    }

    fn persist(&self, state: &ReconcilerState) {
        if let Err(e) = save_state(self.inner.store.as_ref(), state.offline, state.snapshot.as_ref()) {
            tracing::error!(error = %e, "failed to persist offline state");
        }
    }
}

/// Pending updates not yet pushed in their current form.
fn unsynced(snapshot: &OfflineSnapshot, attempted: &HashMap<u64, SetWatchRequest>) -> Vec<SetWatchRequest> {
    snapshot
        .pending_sync
        .iter()
        .map(|&id| snapshot.sync_request(id))
        .filter(|request| attempted.get(&request.id) != Some(request))
        .collect()
}
