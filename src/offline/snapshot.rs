// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline snapshot of server state and its persisted form.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::types::{ConfigResponse, MonitorResponse, SetWatchRequest, TvDetail, WatchStatus};
use crate::store::BlobStore;

/// Blob name of the persisted offline state.
pub const OFFLINE_BLOB: &str = "offline_state.json";

const STATE_VERSION: u32 = 1;

/// Server state captured when going offline, plus the writes made since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineSnapshot {
    pub created_at: DateTime<Utc>,
    /// Monitor summary restricted to shows with a finished download.
    pub monitor: Option<MonitorResponse>,
    pub config: Option<ConfigResponse>,
    pub details: BTreeMap<u64, TvDetail>,
    /// Shows whose watch position changed while offline.
    pub pending_sync: BTreeSet<u64>,
}

impl OfflineSnapshot {
    pub fn new(monitor: Option<MonitorResponse>, config: Option<ConfigResponse>) -> Self {
        Self {
            created_at: Utc::now(),
            monitor,
            config,
            details: BTreeMap::new(),
            pending_sync: BTreeSet::new(),
        }
    }

    /// Snapshot with nothing captured.
    pub fn empty() -> Self {
        Self::new(None, None)
    }

    pub fn monitor_or_placeholder(&self) -> MonitorResponse {
        self.monitor
            .clone()
            .unwrap_or_else(MonitorResponse::offline_placeholder)
    }

    pub fn config_or_placeholder(&self) -> ConfigResponse {
        self.config
            .clone()
            .unwrap_or_else(ConfigResponse::offline_placeholder)
    }

    pub fn detail_or_placeholder(&self, id: u64) -> TvDetail {
        self.details
            .get(&id)
            .cloned()
            .unwrap_or_else(TvDetail::offline_placeholder)
    }

    /// Apply an offline watch update and mark the show for sync.
    pub fn record_watch(&mut self, id: u64, watch: WatchStatus) {
        self.details
            .entry(id)
            .or_insert_with(TvDetail::offline_placeholder)
            .watch = watch.clone();
        if let Some(monitor) = self.monitor.as_mut() {
            if let Some(summary) = monitor.tvs.iter_mut().find(|tv| tv.id == id) {
                summary.watch = watch;
            }
        }
        self.pending_sync.insert(id);
    }

    /// Current watch state of `id`, as it should be pushed on reconnect.
    pub fn sync_request(&self, id: u64) -> SetWatchRequest {
        let watch = self
            .details
            .get(&id)
            .map(|detail| detail.watch.clone())
            .unwrap_or_default();
        SetWatchRequest { id, watch }
    }
}

/// Keep only the shows in `keep`.
pub fn restrict_monitor(mut monitor: MonitorResponse, keep: &BTreeSet<u64>) -> MonitorResponse {
    monitor.tvs.retain(|tv| keep.contains(&tv.id));
    monitor
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    version: u32,
    is_offline: bool,
    snapshot: Option<&'a OfflineSnapshot>,
}

#[derive(Deserialize)]
struct Persisted {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    is_offline: bool,
    #[serde(default)]
    snapshot: Option<OfflineSnapshot>,
}

/// Load the offline flag and snapshot. A missing blob means online.
pub fn load_state(store: &dyn BlobStore) -> Result<(bool, Option<OfflineSnapshot>)> {
    if !store.exists(OFFLINE_BLOB) {
        return Ok((false, None));
    }
    let bytes = store.read(OFFLINE_BLOB)?;
    let persisted: Persisted =
        serde_json::from_slice(&bytes).with_context(|| "Failed to parse offline state")?;
    if persisted.version != STATE_VERSION {
        tracing::warn!(version = persisted.version, "offline state has unexpected version");
    }
    Ok((persisted.is_offline, persisted.snapshot))
}

pub fn save_state(
    store: &dyn BlobStore,
    is_offline: bool,
    snapshot: Option<&OfflineSnapshot>,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&PersistedRef {
        version: STATE_VERSION,
        is_offline,
        snapshot,
    })?;
    store
        .write(OFFLINE_BLOB, &bytes)
        .with_context(|| "Failed to save offline state")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::TvSummary;
    use crate::store::MemoryStore;

    fn summary(id: u64) -> TvSummary {
        TvSummary {
            id,
            name: format!("Show {}", id),
            tag: "watching".to_string(),
            watch: WatchStatus::default(),
            total_episodes: 10,
            icon_url: String::new(),
        }
    }

    fn monitor(ids: &[u64]) -> MonitorResponse {
        MonitorResponse {
            is_new: true,
            version: "v9".to_string(),
            tvs: ids.iter().copied().map(summary).collect(),
            critical_errors: 0,
            errors: 0,
        }
    }

    #[test]
    fn test_restrict_monitor() {
        let keep: BTreeSet<u64> = [2, 4].into_iter().collect();
        let restricted = restrict_monitor(monitor(&[1, 2, 3, 4, 5]), &keep);
        let ids: Vec<u64> = restricted.tvs.iter().map(|tv| tv.id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn test_record_watch_mirrors_into_monitor() {
        let mut snapshot = OfflineSnapshot::new(Some(monitor(&[7])), None);
        snapshot.record_watch(7, WatchStatus::at_episode(3));

        assert_eq!(snapshot.detail_or_placeholder(7).watch.watched_episode, 3);
        assert_eq!(snapshot.monitor_or_placeholder().tvs[0].watch.watched_episode, 3);
        assert!(snapshot.pending_sync.contains(&7));
        assert_eq!(snapshot.sync_request(7).watch, WatchStatus::at_episode(3));
    }

    #[test]
    fn test_missing_entries_use_placeholders() {
        let snapshot = OfflineSnapshot::empty();
        assert_eq!(snapshot.monitor_or_placeholder().version, "offline");
        assert_eq!(snapshot.config_or_placeholder().watched_ratio, 0.9);
        assert_eq!(snapshot.detail_or_placeholder(1).name, "Offline TV Show");
    }

    #[test]
    fn test_state_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(load_state(&store).unwrap(), (false, None));

        let mut snapshot = OfflineSnapshot::new(Some(monitor(&[1])), None);
        snapshot.record_watch(1, WatchStatus::at_episode(2));
        save_state(&store, true, Some(&snapshot)).unwrap();

        let (offline, loaded) = load_state(&store).unwrap();
        assert!(offline);
        assert_eq!(loaded, Some(snapshot));
    }
}
