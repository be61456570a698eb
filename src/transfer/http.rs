// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transport with `Range` support.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;

use super::{TransferBody, TransferError, Transport};
use crate::config::ClientConfig;

/// Only the connection is bounded; episode bodies can take a long time.
const CONNECT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    auth_header: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client for transfers")?;
        Ok(Self {
            client,
            auth_header: config.auth_header.clone(),
        })
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str, offset: u64) -> Result<TransferBody, TransferError> {
        let mut request = self.client.get(url);
        if let Some(auth) = &self.auth_header {
            request = request.header(AUTHORIZATION, auth);
        }
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let status = response.status();
        let (resumed, total_len) = if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            return Err(TransferError::RangeRejected { offset });
        } else if status == StatusCode::PARTIAL_CONTENT {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .or_else(|| response.content_length().map(|len| len + offset));
            (true, total)
        } else if status.is_success() {
            (false, response.content_length())
        } else {
            return Err(TransferError::Http {
                status: status.as_u16(),
            });
        };

        tracing::debug!(url, offset, resumed, ?total_len, "transfer response opened");

        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| TransferError::Network(e.to_string()))
            })
            .boxed();

        Ok(TransferBody {
            resumed,
            total_len,
            stream,
        })
    }
}
