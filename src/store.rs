// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable blob storage for service state.
//!
//! The queue and the reconciler each persist one JSON blob through a
//! [`BlobStore`]. [`FileStore`] writes every blob through a temp file and an
//! atomic rename while holding an exclusive lock on a sibling `.lock` file,
//! so a crash mid-write leaves the previous blob intact and two processes
//! never interleave writes.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;

use crate::locks::{resilient_read, resilient_write};

/// Default timeout for acquiring file locks.
///
/// Lock waits block the calling thread. The queue persists from inside its
/// state lock, often on a runtime worker, so contention must fail fast; a
/// failed write is logged and the next mutation persists again.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Named blob storage used for crash recovery.
pub trait BlobStore: Send + Sync {
    fn exists(&self, name: &str) -> bool;
    fn read(&self, name: &str) -> Result<Vec<u8>>;
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
}

/// Blob store backed by one file per blob in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Override the lock acquisition timeout.
    ///
    /// Keep it short for stores shared with a [`TransferQueue`](crate::download::TransferQueue):
    /// the wait happens on the thread committing the change.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.blob_path(name).with_extension("lock")
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))
    }

    /// Acquire an exclusive lock on `path`, retrying until `timeout` expires.
    fn acquire_exclusive_lock(path: &Path, timeout: Duration) -> Result<File> {
        let lock_file = Self::open_lock_file(path)?;
        let start = Instant::now();

        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another instance may be writing the same state.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
                }
            }
        }
    }

    /// Acquire a shared lock on `path`, retrying until `timeout` expires.
    fn acquire_shared_lock(path: &Path, timeout: Duration) -> Result<File> {
        let lock_file = Self::open_lock_file(path)?;
        let start = Instant::now();

        loop {
            match FileExt::try_lock_shared(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!("Timed out waiting for shared lock on {:?} after {:?}", path, timeout);
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to acquire shared lock on {:?}", path));
                }
            }
        }
    }
}

impl BlobStore for FileStore {
    fn exists(&self, name: &str) -> bool {
        self.blob_path(name).exists()
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(name);
        let _lock = Self::acquire_shared_lock(&self.lock_path(name), self.lock_timeout)?;
        fs::read(&path).with_context(|| format!("Failed to read blob {:?}", path))
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(name);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory: {:?}", self.dir))?;

        // Held through the rename so readers never see a half-written blob.
        let _lock_guard = Self::acquire_exclusive_lock(&self.lock_path(name), self.lock_timeout)?;

        let temp_path = path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(bytes)
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &path).with_context(|| {
            format!("Failed to rename temp file into place: {:?} -> {:?}", temp_path, path)
        })?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.blob_path(name);
        let _lock_guard = Self::acquire_exclusive_lock(&self.lock_path(name), self.lock_timeout)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob {:?}", path)),
        }
    }
}

/// Blob store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryStore {
    fn exists(&self, name: &str) -> bool {
        resilient_read(&self.blobs).contains_key(name)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        match resilient_read(&self.blobs).get(name) {
            Some(bytes) => Ok(bytes.clone()),
            None => bail!("No blob named {}", name),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        resilient_write(&self.blobs).insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        resilient_write(&self.blobs).remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::new(temp_dir.path().join("state"));

        assert!(!store.exists("queue.json"));
        store.write("queue.json", b"{\"a\":1}").unwrap();
        assert!(store.exists("queue.json"));
        assert_eq!(store.read("queue.json").unwrap(), b"{\"a\":1}");

        store.write("queue.json", b"{}").unwrap();
        assert_eq!(store.read("queue.json").unwrap(), b"{}");
        assert!(!temp_dir.path().join("state").join("queue.tmp").exists());

        store.delete("queue.json").unwrap();
        assert!(!store.exists("queue.json"));
        // Deleting twice is fine.
        store.delete("queue.json").unwrap();
    }

    #[test]
    fn test_read_missing_blob_errors() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::new(temp_dir.path());
        assert!(store.read("nope.json").is_err());
        assert!(MemoryStore::new().read("nope.json").is_err());
    }

    #[test]
    fn test_exclusive_lock_times_out() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = temp_dir.path().join("held.lock");

        let _held = FileStore::acquire_exclusive_lock(&lock_path, Duration::from_secs(1))
            .expect("First lock should succeed");

        let start = Instant::now();
        let second = FileStore::acquire_exclusive_lock(&lock_path, Duration::from_millis(200));
        assert!(second.is_err());
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(second.unwrap_err().to_string().contains("Timed out"));
    }

    #[test]
    fn test_write_fails_while_lock_held() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::new(temp_dir.path()).with_lock_timeout(Duration::from_millis(100));

        let _held = FileStore::acquire_exclusive_lock(
            &temp_dir.path().join("state.lock"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(store.write("state.json", b"{}").is_err());
    }

    #[test]
    fn test_default_lock_timeout_fails_fast() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::new(temp_dir.path());

        let _held = FileStore::acquire_exclusive_lock(
            &temp_dir.path().join("queue.lock"),
            Duration::from_secs(1),
        )
        .unwrap();

        let start = Instant::now();
        assert!(store.write("queue.json", b"[]").is_err());
        assert!(start.elapsed() >= LOCK_TIMEOUT);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_concurrent_writers_serialized() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(FileStore::new(temp_dir.path()).with_lock_timeout(Duration::from_secs(10)));
        let writes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                let writes = Arc::clone(&writes);
                thread::spawn(move || {
                    for j in 0..5 {
                        let body = format!("{{\"writer\":{},\"n\":{}}}", i, j);
                        store.write("shared.json", body.as_bytes()).unwrap();
                        writes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert_eq!(writes.load(Ordering::SeqCst), 20);
        let last: serde_json::Value =
            serde_json::from_slice(&store.read("shared.json").unwrap()).unwrap();
        assert!(last["writer"].is_u64());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.write("a", b"1").unwrap();
        assert!(store.exists("a"));
        assert_eq!(store.read("a").unwrap(), b"1");
        store.delete("a").unwrap();
        assert!(!store.exists("a"));
    }
}
