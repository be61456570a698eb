// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One resumable download into one file.
//!
//! Each call to [`ResumableTransfer::start`] or [`ResumableTransfer::resume`]
//! begins a new run and returns its future. Runs are serialized on the file,
//! and starting a run supersedes the previous one: the older run stops at its
//! next chunk boundary and reports [`TransferOutcome::Paused`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;

use super::{TransferError, TransferProgress, Transport};
use crate::locks::resilient_lock;

/// Progress is reported at most once per this many bytes, plus a final report.
pub const PROGRESS_STEP_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Run,
    Pause,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Fresh,
    Resume,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The whole body is on disk.
    Finished { path: PathBuf, bytes: u64 },
    /// Stopped by `pause()` or superseded by a newer run; bytes stay on disk.
    Paused { bytes_written: u64 },
    /// Stopped by `cancel()`. The file is left for the caller to remove.
    Cancelled,
}

struct Inner {
    transport: Arc<dyn Transport>,
    url: String,
    destination: PathBuf,
    control: Mutex<watch::Sender<Signal>>,
    run_lock: tokio::sync::Mutex<()>,
}

/// Cloneable handle to a single-file transfer.
#[derive(Clone)]
pub struct ResumableTransfer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResumableTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableTransfer")
            .field("url", &self.inner.url)
            .field("destination", &self.inner.destination)
            .finish_non_exhaustive()
    }
}

impl ResumableTransfer {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        let (control, _) = watch::channel(Signal::Run);
        Self {
            inner: Arc::new(Inner {
                transport,
                url: url.into(),
                destination: destination.into(),
                control: Mutex::new(control),
                run_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    /// Truncate the destination and download from byte 0.
    pub fn start<F>(&self, on_progress: F) -> BoxFuture<'static, Result<TransferOutcome, TransferError>>
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        self.begin_run(Mode::Fresh, on_progress)
    }

    /// Continue from the on-disk length. Fails with
    /// [`TransferError::RangeRejected`] when the server will not continue
    /// from there.
    pub fn resume<F>(&self, on_progress: F) -> BoxFuture<'static, Result<TransferOutcome, TransferError>>
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        self.begin_run(Mode::Resume, on_progress)
    }

    /// Stop the current run after flushing what was written.
    pub fn pause(&self) {
        resilient_lock(&self.inner.control).send_replace(Signal::Pause);
    }

    /// Abort the current run.
    pub fn cancel(&self) {
        resilient_lock(&self.inner.control).send_replace(Signal::Cancel);
    }

    fn begin_run<F>(&self, mode: Mode, on_progress: F) -> BoxFuture<'static, Result<TransferOutcome, TransferError>>
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        // Replacing the sender closes the previous run's channel.
        let (tx, rx) = watch::channel(Signal::Run);
        *resilient_lock(&self.inner.control) = tx;
        Box::pin(Arc::clone(&self.inner).run(mode, rx, on_progress))
    }
}

/// Resolves once the run should stop. A closed channel means superseded.
async fn stop_requested(signal: &mut watch::Receiver<Signal>) -> Signal {
    loop {
        let current = *signal.borrow_and_update();
        if current != Signal::Run {
            return current;
        }
        if signal.changed().await.is_err() {
            return Signal::Pause;
        }
    }
}

fn stopped(signal: Signal, bytes_written: u64) -> TransferOutcome {
    match signal {
        Signal::Cancel => TransferOutcome::Cancelled,
        _ => TransferOutcome::Paused { bytes_written },
    }
}

impl Inner {
    async fn run<F>(
        self: Arc<Self>,
        mode: Mode,
        mut signal: watch::Receiver<Signal>,
        on_progress: F,
    ) -> Result<TransferOutcome, TransferError>
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        let _run = self.run_lock.lock().await;

        let offset = match mode {
            Mode::Fresh => 0,
            Mode::Resume => tokio::fs::metadata(&self.destination)
                .await
                .map(|m| m.len())
                .unwrap_or(0),
        };

        let body = tokio::select! {
            biased;
            stop = stop_requested(&mut signal) => return Ok(stopped(stop, offset)),
            body = self.transport.open(&self.url, offset) => body?,
        };

        if offset > 0 && !body.resumed {
            tracing::debug!(url = %self.url, offset, "server ignored range request");
            return Err(TransferError::RangeRejected { offset });
        }

        if let Some(parent) = self.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = if offset == 0 {
            tokio::fs::File::create(&self.destination).await?
        } else {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&self.destination)
                .await?
        };
        let mut file = BufWriter::new(file);

        let total = body.total_len;
        let mut stream = body.stream;
        let mut written = offset;
        let mut reported: Option<u64> = None;

        loop {
            let next = tokio::select! {
                biased;
                stop = stop_requested(&mut signal) => {
                    file.flush().await?;
                    tracing::debug!(url = %self.url, written, ?stop, "transfer stopped");
                    return Ok(stopped(stop, written));
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                    if written - reported.unwrap_or(offset) >= PROGRESS_STEP_BYTES {
                        on_progress(TransferProgress {
                            bytes_written: written,
                            bytes_expected: total,
                        });
                        reported = Some(written);
                    }
                }
                Some(Err(e)) => {
                    let _ = file.flush().await;
                    return Err(e);
                }
                None => break,
            }
        }

        file.flush().await?;
        file.get_ref().sync_all().await?;

        if let Some(total) = total {
            if written < total {
                return Err(TransferError::Network(format!(
                    "body ended after {} of {} bytes",
                    written, total
                )));
            }
        }

        if reported != Some(written) {
            on_progress(TransferProgress {
                bytes_written: written,
                bytes_expected: total,
            });
        }

        Ok(TransferOutcome::Finished {
            path: self.destination.clone(),
            bytes: written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::MemoryTransport;
    use std::time::Duration;
    use tempfile::TempDir;

    const URL: &str = "mem://episode";

    fn setup(data: &[u8]) -> (TempDir, Arc<MemoryTransport>, ResumableTransfer) {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(URL, data.to_vec());
        let transfer =
            ResumableTransfer::new(transport.clone(), URL, dir.path().join("media").join("ep.mp4"));
        (dir, transport, transfer)
    }

    fn recorder() -> (Arc<Mutex<Vec<f64>>>, impl Fn(TransferProgress) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p: TransferProgress| sink.lock().unwrap().push(p.fraction()))
    }

    #[tokio::test]
    async fn test_start_writes_whole_body() {
        let (_dir, _transport, transfer) = setup(b"hello episode");
        let (seen, on_progress) = recorder();

        let outcome = transfer.start(on_progress).await.unwrap();
        assert_eq!(
            outcome,
            TransferOutcome::Finished {
                path: transfer.destination().to_path_buf(),
                bytes: 13
            }
        );
        assert_eq!(std::fs::read(transfer.destination()).unwrap(), b"hello episode");
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_progress_is_rate_limited() {
        let data = vec![7u8; 1024 * 1024];
        let (_dir, transport, transfer) = setup(&data);
        transport.set_chunk_size(URL, 64 * 1024);
        let (seen, on_progress) = recorder();

        transfer.start(on_progress).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_resume_continues_from_partial_file() {
        let (_dir, transport, transfer) = setup(b"0123456789");
        std::fs::create_dir_all(transfer.destination().parent().unwrap()).unwrap();
        std::fs::write(transfer.destination(), b"0123").unwrap();

        let outcome = transfer.resume(|_| {}).await.unwrap();
        assert!(matches!(outcome, TransferOutcome::Finished { bytes: 10, .. }));
        assert_eq!(transport.opened(URL), vec![4]);
        assert_eq!(std::fs::read(transfer.destination()).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_resume_rejected_when_range_ignored() {
        let (_dir, transport, transfer) = setup(b"0123456789");
        transport.ignore_ranges(URL);
        std::fs::create_dir_all(transfer.destination().parent().unwrap()).unwrap();
        std::fs::write(transfer.destination(), b"0123").unwrap();

        let err = transfer.resume(|_| {}).await.unwrap_err();
        assert_eq!(err, TransferError::RangeRejected { offset: 4 });
        // The partial file is untouched; the caller decides what to do with it.
        assert_eq!(std::fs::read(transfer.destination()).unwrap(), b"0123");
    }

    #[tokio::test]
    async fn test_pause_and_cancel_while_held() {
        let (_dir, transport, transfer) = setup(b"0123456789");
        transport.hold(URL);

        let run = tokio::spawn(transfer.start(|_| {}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        transfer.pause();
        assert_eq!(
            run.await.unwrap().unwrap(),
            TransferOutcome::Paused { bytes_written: 0 }
        );

        let run = tokio::spawn(transfer.resume(|_| {}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        transfer.cancel();
        assert_eq!(run.await.unwrap().unwrap(), TransferOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_new_run_supersedes_old() {
        let (_dir, transport, transfer) = setup(b"0123456789");
        transport.hold(URL);

        let first = tokio::spawn(transfer.start(|_| {}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn(transfer.start(|_| {}));

        assert!(matches!(
            first.await.unwrap().unwrap(),
            TransferOutcome::Paused { .. }
        ));
        transport.release(URL);
        assert!(matches!(
            second.await.unwrap().unwrap(),
            TransferOutcome::Finished { bytes: 10, .. }
        ));
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let (_dir, transport, transfer) = setup(b"0123456789");
        transport.fail(URL, "connection reset");

        let err = transfer.start(|_| {}).await.unwrap_err();
        assert_eq!(err, TransferError::Network("connection reset".to_string()));
    }
}
