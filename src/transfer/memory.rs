// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory transport.
//!
//! Serves byte buffers registered by URL. A resource can be held so that
//! bodies stall before their first chunk until it is released, which lets
//! callers observe transfers while they are in flight. The resource is read
//! when the hold lifts, so failures configured while held still apply.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use super::{TransferBody, TransferError, Transport};
use crate::locks::resilient_lock;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct Resource {
    data: Vec<u8>,
    chunk_size: usize,
    honor_ranges: bool,
    report_length: bool,
    failure: Option<String>,
    gate: watch::Sender<bool>,
}

type Resources = Arc<Mutex<HashMap<String, Resource>>>;

#[derive(Debug, Default)]
pub struct MemoryTransport {
    resources: Resources,
    opens: Mutex<Vec<(String, u64)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` at `url`.
    pub fn insert(&self, url: &str, data: impl Into<Vec<u8>>) {
        let (gate, _) = watch::channel(true);
        resilient_lock(&self.resources).insert(
            url.to_string(),
            Resource {
                data: data.into(),
                chunk_size: DEFAULT_CHUNK_SIZE,
                honor_ranges: true,
                report_length: true,
                failure: None,
                gate,
            },
        );
    }

    fn update(&self, url: &str, f: impl FnOnce(&mut Resource)) {
        if let Some(resource) = resilient_lock(&self.resources).get_mut(url) {
            f(resource);
        }
    }

    pub fn set_chunk_size(&self, url: &str, chunk_size: usize) {
        self.update(url, |r| r.chunk_size = chunk_size.max(1));
    }

    /// Answer ranged requests with the whole body, like a server without range support.
    pub fn ignore_ranges(&self, url: &str) {
        self.update(url, |r| r.honor_ranges = false);
    }

    /// Omit the total length from responses.
    pub fn hide_length(&self, url: &str) {
        self.update(url, |r| r.report_length = false);
    }

    /// Make bodies for `url` end with `message` instead of data.
    pub fn fail(&self, url: &str, message: &str) {
        self.update(url, |r| r.failure = Some(message.to_string()));
    }

    /// Stall bodies for `url` before their first chunk.
    pub fn hold(&self, url: &str) {
        self.update(url, |r| {
            r.gate.send_replace(false);
        });
    }

    /// Let stalled and future bodies for `url` proceed.
    pub fn release(&self, url: &str) {
        self.update(url, |r| {
            r.gate.send_replace(true);
        });
    }

    /// Offsets requested for `url`, in order.
    pub fn opened(&self, url: &str) -> Vec<u64> {
        resilient_lock(&self.opens)
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

struct BodyState {
    resources: Resources,
    url: String,
    offset: u64,
    gate: Option<watch::Receiver<bool>>,
    chunks: Option<VecDeque<Result<Vec<u8>, TransferError>>>,
}

impl BodyState {
    fn materialize(&self) -> VecDeque<Result<Vec<u8>, TransferError>> {
        let resources = resilient_lock(&self.resources);
        let Some(resource) = resources.get(&self.url) else {
            return VecDeque::from([Err(TransferError::Network("resource removed".to_string()))]);
        };
        if let Some(message) = &resource.failure {
            return VecDeque::from([Err(TransferError::Network(message.clone()))]);
        }
        let start = (self.offset as usize).min(resource.data.len());
        resource.data[start..]
            .chunks(resource.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str, offset: u64) -> Result<TransferBody, TransferError> {
        resilient_lock(&self.opens).push((url.to_string(), offset));

        let (resumed, total_len, gate) = {
            let resources = resilient_lock(&self.resources);
            let resource = resources
                .get(url)
                .ok_or(TransferError::Http { status: 404 })?;
            let len = resource.data.len() as u64;
            if offset > len && resource.honor_ranges {
                return Err(TransferError::RangeRejected { offset });
            }
            let total = resource.report_length.then_some(len);
            (resource.honor_ranges, total, resource.gate.subscribe())
        };

        let state = BodyState {
            resources: Arc::clone(&self.resources),
            url: url.to_string(),
            offset: if resumed { offset } else { 0 },
            gate: Some(gate),
            chunks: None,
        };

        let stream = futures_util::stream::unfold(state, |mut state| async move {
            if let Some(mut gate) = state.gate.take() {
                let _ = gate.wait_for(|open| *open).await;
            }
            if state.chunks.is_none() {
                state.chunks = Some(state.materialize());
            }
            let next = state.chunks.as_mut().and_then(|chunks| chunks.pop_front())?;
            Some((next, state))
        });

        Ok(TransferBody {
            resumed,
            total_len,
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    async fn drain(body: TransferBody) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::new();
        let mut stream = body.stream;
        while let Some(chunk) = stream.next().await {
            out.extend(chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_serves_ranges_in_chunks() {
        let transport = MemoryTransport::new();
        transport.insert("mem://a", b"abcdefgh".to_vec());
        transport.set_chunk_size("mem://a", 3);

        let body = transport.open("mem://a", 2).await.unwrap();
        assert!(body.resumed);
        assert_eq!(body.total_len, Some(8));
        assert_eq!(drain(body).await.unwrap(), b"cdefgh");
        assert_eq!(transport.opened("mem://a"), vec![2]);
    }

    #[tokio::test]
    async fn test_ignored_range_serves_full_body() {
        let transport = MemoryTransport::new();
        transport.insert("mem://a", b"abcdefgh".to_vec());
        transport.ignore_ranges("mem://a");

        let body = transport.open("mem://a", 5).await.unwrap();
        assert!(!body.resumed);
        assert_eq!(drain(body).await.unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_hold_then_fail() {
        let transport = MemoryTransport::new();
        transport.insert("mem://a", b"abc".to_vec());
        transport.hold("mem://a");

        let body = transport.open("mem://a", 0).await.unwrap();
        let pending = tokio::spawn(drain(body));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        transport.fail("mem://a", "reset by peer");
        transport.release("mem://a");
        let result = pending.await.unwrap();
        assert_eq!(result, Err(TransferError::Network("reset by peer".to_string())));
    }

    #[tokio::test]
    async fn test_hold_before_any_open_stalls_bodies() {
        let transport = MemoryTransport::new();
        transport.insert("mem://a", b"abc".to_vec());
        transport.hold("mem://a");

        let body = transport.open("mem://a", 0).await.unwrap();
        let pending = tokio::spawn(drain(body));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        transport.release("mem://a");
        assert_eq!(pending.await.unwrap().unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_unknown_url() {
        let transport = MemoryTransport::new();
        let err = transport.open("mem://nope", 0).await.unwrap_err();
        assert_eq!(err, TransferError::Http { status: 404 });
    }
}
