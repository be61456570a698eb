// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent queue state.
//!
//! The item table is saved as one blob after every mutation so the queue can
//! be rebuilt after a restart. Live transfer handles are never part of it.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::types::{ItemKey, TransferItem, TransferStatus};
use crate::store::BlobStore;

/// Blob name of the persisted queue.
pub const QUEUE_BLOB: &str = "downloads_metadata.json";

const STATE_VERSION: u32 = 1;

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    last_saved: Option<DateTime<Utc>>,
    items: Vec<TransferItem>,
}

/// Tally of items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub downloading: usize,
    pub paused: usize,
    pub finished: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.downloading + self.paused + self.finished + self.error
    }
}

/// Transfer items in insertion order.
#[derive(Debug, Clone, Default)]
pub struct QueueState {
    items: IndexMap<ItemKey, TransferItem>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted queue. A missing blob is an empty queue.
    pub fn load(store: &dyn BlobStore) -> Result<Self> {
        if !store.exists(QUEUE_BLOB) {
            return Ok(Self::new());
        }
        let bytes = store.read(QUEUE_BLOB)?;
        let persisted: PersistedQueue =
            serde_json::from_slice(&bytes).with_context(|| "Failed to parse queue state")?;
        if persisted.version != STATE_VERSION {
            tracing::warn!(
                version = persisted.version,
                expected = STATE_VERSION,
                "queue state has unexpected version; loading anyway"
            );
        }
        let items = persisted
            .items
            .into_iter()
            .map(|item| (item.key, item))
            .collect();
        Ok(Self { items })
    }

    pub fn save(&self, store: &dyn BlobStore) -> Result<()> {
        let persisted = PersistedQueue {
            version: STATE_VERSION,
            last_saved: Some(Utc::now()),
            items: self.items.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        store
            .write(QUEUE_BLOB, &bytes)
            .with_context(|| "Failed to save queue state")
    }

    /// Demote pending and downloading items to paused. Returns how many changed.
    pub fn recover(&mut self) -> usize {
        self.items
            .values_mut()
            .map(|item| item.recover())
            .filter(|changed| *changed)
            .count()
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &ItemKey) -> Option<&TransferItem> {
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &ItemKey) -> Option<&mut TransferItem> {
        self.items.get_mut(key)
    }

    /// Append an item. The caller checks for duplicates first.
    pub fn insert(&mut self, item: TransferItem) {
        self.items.insert(item.key, item);
    }

    /// Remove an item, keeping the order of the rest.
    pub fn remove(&mut self, key: &ItemKey) -> Option<TransferItem> {
        self.items.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransferItem> {
        self.items.values()
    }

    pub fn to_vec(&self) -> Vec<TransferItem> {
        self.items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Earliest-inserted pending item.
    pub fn next_pending(&self) -> Option<ItemKey> {
        self.items
            .values()
            .find(|item| item.status == TransferStatus::Pending)
            .map(|item| item.key)
    }

    pub fn count(&self, status: TransferStatus) -> usize {
        self.items.values().filter(|item| item.status == status).count()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for item in self.items.values() {
            match item.status {
                TransferStatus::Pending => counts.pending += 1,
                TransferStatus::Downloading => counts.downloading += 1,
                TransferStatus::Paused => counts.paused += 1,
                TransferStatus::Finished => counts.finished += 1,
                TransferStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Whether any item already uses `name` as its destination.
    pub fn destination_taken(&self, name: &str) -> bool {
        self.items.values().any(|item| item.destination_name == name)
    }
}

/// Pick a file name in `media_dir` that neither exists on disk nor is
/// claimed by a queued item, appending ` (n)` before the extension.
pub fn unique_destination_name(
    media_dir: &Path,
    filename: &str,
    taken: impl Fn(&str) -> bool,
) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("download")
        .to_string();

    let in_use = |name: &str| taken(name) || media_dir.join(name).exists();
    if !in_use(&base) {
        return base;
    }

    let (stem, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => base.split_at(idx),
        _ => (base.as_str(), ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if !in_use(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
