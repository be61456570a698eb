// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer queue manager.
//!
//! Owns the item table and the live transfer handles. Every mutation runs
//! admission control, persists the table and notifies subscribers before the
//! operation returns. Transfers run as spawned tasks; their progress and
//! completion reports are applied only if they still belong to the item's
//! current run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::state::{unique_destination_name, QueueState, StatusCounts};
use super::types::{ItemKey, TransferItem, TransferStatus};
use crate::config::{self, ClientConfig, DEFAULT_MAX_CONCURRENT_TRANSFERS};
use crate::locks::{resilient_read, resilient_write};
use crate::observe::{Observers, Subscription};
use crate::store::BlobStore;
use crate::transfer::{ResumableTransfer, TransferError, TransferOutcome, TransferProgress, Transport};

type TransferFuture = BoxFuture<'static, Result<TransferOutcome, TransferError>>;

/// Settings for a [`TransferQueue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Directory downloaded episodes are written into.
    pub media_dir: PathBuf,
    /// Maximum number of items downloading at once.
    pub max_concurrent: usize,
    /// Relative source URLs are resolved against this when set.
    pub base_url: Option<String>,
}

impl QueueOptions {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
            max_concurrent: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            base_url: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            media_dir: config.media_dir(),
            max_concurrent: config.max_concurrent_transfers.max(1),
            base_url: Some(config.base_url.clone()),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn resolve(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) => config::resolve_url(base, url),
            None => url.to_string(),
        }
    }
}

/// Result of [`TransferQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// An item with the same key exists; nothing changed.
    AlreadyQueued,
}

/// A transfer handle and the run currently allowed to report into the item.
struct LiveTransfer {
    transfer: ResumableTransfer,
    run: Option<u64>,
}

struct QueueCore {
    items: QueueState,
    live: HashMap<ItemKey, LiveTransfer>,
    tasks: Vec<JoinHandle<()>>,
    seq: u64,
    next_run: u64,
    shut_down: bool,
}

struct Shared {
    core: RwLock<QueueCore>,
    observers: Observers<Vec<TransferItem>>,
    store: Arc<dyn BlobStore>,
    transport: Arc<dyn Transport>,
    options: QueueOptions,
}

/// Persistent download queue with bounded concurrency.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct TransferQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TransferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferQueue")
            .field("options", &self.shared.options)
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

impl TransferQueue {
    /// Load the persisted queue and demote interrupted work to paused.
    ///
    /// An unreadable queue blob is logged and replaced by an empty queue.
    pub fn open(
        options: QueueOptions,
        store: Arc<dyn BlobStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut items = match QueueState::load(store.as_ref()) {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "failed to load queue state, starting empty");
                QueueState::new()
            }
        };

        let recovered = items.recover();
        if recovered > 0 {
            tracing::info!(recovered, "demoted interrupted transfers to paused");
            if let Err(e) = items.save(store.as_ref()) {
                tracing::error!(error = %e, "failed to persist recovered queue state");
            }
        }

        let snapshot = items.to_vec();
        Self {
            shared: Arc::new(Shared {
                core: RwLock::new(QueueCore {
                    items,
                    live: HashMap::new(),
                    tasks: Vec::new(),
                    seq: 0,
                    next_run: 1,
                    shut_down: false,
                }),
                observers: Observers::new(snapshot),
                store,
                transport,
                options,
            }),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.shared.options
    }

    /// Queue an episode. Re-enqueueing an existing key is a logged no-op.
    pub async fn enqueue(
        &self,
        url: &str,
        filename: &str,
        show_id: u64,
        episode: u32,
    ) -> EnqueueOutcome {
        let key = ItemKey::new(show_id, episode);
        let mut core = resilient_write(&self.shared.core);
        if core.items.contains(&key) {
            tracing::warn!(%key, "download already queued");
            return EnqueueOutcome::AlreadyQueued;
        }

        let source_url = self.shared.options.resolve(url);
        let name = unique_destination_name(&self.shared.options.media_dir, filename, |n| {
            core.items.destination_taken(n)
        });
        tracing::info!(%key, url = %source_url, file = %name, "queued download");
        core.items.insert(TransferItem::new(key, source_url, name));

        self.shared.commit(core);
        EnqueueOutcome::Queued
    }

    /// Pause a pending or downloading item. Returns false if nothing changed.
    pub async fn pause(&self, key: ItemKey) -> bool {
        let mut core = resilient_write(&self.shared.core);
        let Some(item) = core.items.get_mut(&key) else {
            return false;
        };
        let was = item.status;
        if let Err(e) = item.pause() {
            tracing::debug!(%key, error = %e, "pause ignored");
            return false;
        }
        if was == TransferStatus::Downloading {
            if let Some(live) = core.live.get_mut(&key) {
                live.run = None;
                live.transfer.pause();
            }
        }
        tracing::info!(%key, "paused download");
        self.shared.commit(core);
        true
    }

    /// Move a paused item back to pending. Returns false if nothing changed.
    pub async fn resume(&self, key: ItemKey) -> bool {
        let mut core = resilient_write(&self.shared.core);
        let Some(item) = core.items.get_mut(&key) else {
            return false;
        };
        if let Err(e) = item.resume() {
            tracing::debug!(%key, error = %e, "resume ignored");
            return false;
        }
        tracing::info!(%key, "resumed download");
        self.shared.commit(core);
        true
    }

    /// Cancel any transfer, delete the local file and forget the item.
    pub async fn delete(&self, key: ItemKey) -> bool {
        let mut core = resilient_write(&self.shared.core);
        let Some(item) = core.items.remove(&key) else {
            return false;
        };
        if let Some(live) = core.live.remove(&key) {
            live.transfer.cancel();
        }
        let artifact = item
            .local_uri
            .clone()
            .unwrap_or_else(|| self.shared.options.media_dir.join(&item.destination_name));
        remove_artifact(&artifact);
        tracing::info!(%key, "deleted download");
        self.shared.commit(core);
        true
    }

    /// Register `listener`; it receives the full list now and after every change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[TransferItem]) + Send + Sync + 'static,
    {
        self.shared
            .observers
            .subscribe(move |items: &Vec<TransferItem>| listener(items))
    }

    pub fn get_all(&self) -> Vec<TransferItem> {
        resilient_read(&self.shared.core).items.to_vec()
    }

    pub fn get_by_key(&self, show_id: u64, episode: u32) -> Option<TransferItem> {
        resilient_read(&self.shared.core)
            .items
            .get(&ItemKey::new(show_id, episode))
            .cloned()
    }

    pub fn counts(&self) -> StatusCounts {
        resilient_read(&self.shared.core).items.counts()
    }

    /// True when no item is pending or downloading.
    pub fn is_idle(&self) -> bool {
        let counts = self.counts();
        counts.pending == 0 && counts.downloading == 0
    }

    /// Resolve once no item is pending or downloading.
    pub async fn wait_idle(&self) {
        let (tx, mut rx) = watch::channel(false);
        let _subscription = self.subscribe(move |items| {
            let idle = !items.iter().any(|item| item.status.is_active());
            let _ = tx.send(idle);
        });
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Pause running transfers, demote pending items and persist.
    ///
    /// Waits for the running transfers to flush. No item is started afterwards.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut core = resilient_write(&self.shared.core);
            core.shut_down = true;
            for live in core.live.values_mut() {
                if live.run.take().is_some() {
                    live.transfer.pause();
                }
            }
            let demoted = core.items.recover();
            let tasks = std::mem::take(&mut core.tasks);
            tracing::info!(demoted, running = tasks.len(), "shutting down transfer queue");
            self.shared.commit(core);
            tasks
        };

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "transfer task ended abnormally");
            }
        }
    }
}

impl Shared {
    /// Run admission, persist and notify, then release the lock.
    fn commit(self: &Arc<Self>, mut core: RwLockWriteGuard<'_, QueueCore>) {
        self.admit(&mut core);
        if let Err(e) = core.items.save(self.store.as_ref()) {
            tracing::error!(error = %e, "failed to persist queue state");
        }
        core.seq += 1;
        let seq = core.seq;
        let snapshot = core.items.to_vec();
        drop(core);
        self.observers.publish(seq, snapshot);
    }

    /// Start the earliest pending items while slots are free.
    fn admit(self: &Arc<Self>, core: &mut QueueCore) {
        if core.shut_down {
            return;
        }
        core.tasks.retain(|task| !task.is_finished());
        while core.items.count(TransferStatus::Downloading) < self.options.max_concurrent {
            let Some(key) = core.items.next_pending() else {
                break;
            };
            if !self.launch(core, key) {
                break;
            }
        }
    }

    fn launch(self: &Arc<Self>, core: &mut QueueCore, key: ItemKey) -> bool {
        let (url, destination) = match core.items.get_mut(&key) {
            Some(item) => {
                if let Err(e) = item.begin() {
                    tracing::error!(%key, error = %e, "admission picked an item it cannot start");
                    return false;
                }
                (
                    item.source_url.clone(),
                    self.options.media_dir.join(&item.destination_name),
                )
            }
            None => return false,
        };

        let run = core.next_run;
        core.next_run += 1;

        let live = core.live.entry(key).or_insert_with(|| LiveTransfer {
            transfer: ResumableTransfer::new(Arc::clone(&self.transport), url, destination.clone()),
            run: None,
        });
        live.run = Some(run);
        let future = live.transfer.resume(self.progress_reporter(key, run));

        tracing::debug!(%key, run, "starting transfer");
        let task = tokio::spawn(Arc::clone(self).drive(key, destination, run, future));
        core.tasks.push(task);
        true
    }

    fn progress_reporter(self: &Arc<Self>, key: ItemKey, run: u64) -> impl Fn(TransferProgress) + Send + Sync + 'static {
        let shared = Arc::downgrade(self);
        move |progress| {
            if let Some(shared) = shared.upgrade() {
                shared.apply_progress(key, run, progress.fraction());
            }
        }
    }

    fn is_current(core: &QueueCore, key: &ItemKey, run: u64) -> bool {
        core.live.get(key).and_then(|live| live.run) == Some(run)
    }

    fn apply_progress(self: &Arc<Self>, key: ItemKey, run: u64, fraction: f64) {
        let mut core = resilient_write(&self.core);
        if !Self::is_current(&core, &key, run) {
            return;
        }
        let applied = core
            .items
            .get_mut(&key)
            .map(|item| item.set_progress(fraction))
            .unwrap_or(false);
        if applied {
            self.commit(core);
        }
    }

    /// Await a run and whatever restart it requires.
    async fn drive(self: Arc<Self>, key: ItemKey, destination: PathBuf, run: u64, future: TransferFuture) {
        let mut run = run;
        let mut future = future;
        loop {
            let result = future.await;
            match self.settle(key, &destination, run, result) {
                Some((next_run, next_future)) => {
                    run = next_run;
                    future = next_future;
                }
                None => break,
            }
        }
    }

    /// Apply the end of a run. Returns a replacement run when the transfer
    /// restarts from zero in the same slot.
    fn settle(
        self: &Arc<Self>,
        key: ItemKey,
        destination: &Path,
        run: u64,
        result: Result<TransferOutcome, TransferError>,
    ) -> Option<(u64, TransferFuture)> {
        let mut core = resilient_write(&self.core);
        let current = Self::is_current(&core, &key, run);

        match result {
            Ok(TransferOutcome::Paused { bytes_written }) => {
                tracing::debug!(%key, run, bytes_written, "transfer run paused");
                None
            }
            Ok(TransferOutcome::Cancelled) => {
                let name = destination.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if !core.items.destination_taken(name) {
                    remove_artifact(destination);
                }
                None
            }
            Ok(TransferOutcome::Finished { path, bytes }) => {
                if !current {
                    tracing::debug!(%key, run, "ignoring completion from stale run");
                    return None;
                }
                core.live.remove(&key);
                if let Some(item) = core.items.get_mut(&key) {
                    if let Err(e) = item.finish(path) {
                        tracing::warn!(%key, error = %e, "completion did not apply");
                    }
                }
                tracing::info!(%key, bytes, "download finished");
                self.commit(core);
                None
            }
            Err(TransferError::RangeRejected { offset }) if current => {
                tracing::warn!(%key, offset, "server refused to resume, restarting from zero");
                remove_artifact(destination);
                if let Some(item) = core.items.get_mut(&key) {
                    item.set_progress(0.0);
                }
                let next = core.next_run;
                core.next_run += 1;
                let transfer = match core.live.get_mut(&key) {
                    Some(live) => {
                        live.run = Some(next);
                        live.transfer.clone()
                    }
                    None => return None,
                };
                let future = transfer.start(self.progress_reporter(key, next));
                self.commit(core);
                Some((next, future))
            }
            Err(e) => {
                if !current {
                    tracing::debug!(%key, run, error = %e, "ignoring failure from stale run");
                    return None;
                }
                core.live.remove(&key);
                if let Some(item) = core.items.get_mut(&key) {
                    if let Err(te) = item.fail(e.to_string()) {
                        tracing::warn!(%key, error = %te, "failure did not apply");
                    }
                }
                tracing::warn!(%key, error = %e, "download failed");
                self.commit(core);
                None
            }
        }
    }
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed download file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove download file"),
    }
}
