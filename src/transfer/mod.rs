// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resumable single-file transfers.
//!
//! A [`ResumableTransfer`] downloads one URL into one file through a
//! [`Transport`]. It can be paused (bytes already written stay on disk),
//! resumed from the on-disk length with a ranged request, or cancelled.
//!
//! ```text
//! ┌──────────────────┐  open(url, offset)  ┌───────────────┐
//! │ ResumableTransfer│────────────────────▶│ Transport     │
//! │ (file + control) │◀────────────────────│ HTTP / memory │
//! └──────────────────┘   TransferBody      └───────────────┘
//! ```

pub mod http;
pub mod memory;
pub mod resumable;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub use http::HttpTransport;
pub use memory::MemoryTransport;
pub use resumable::{ResumableTransfer, TransferOutcome};

/// Stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransferError>>;

/// Errors raised while moving bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferError {
    /// Connection failure or a body that ended early.
    Network(String),
    /// The server answered with a non-success status.
    Http { status: u16 },
    /// Local file I/O failed.
    Io(String),
    /// The server would not continue from `offset`; the partial file cannot be trusted.
    RangeRejected { offset: u64 },
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Http { status } => write!(f, "Download failed with HTTP status {}", status),
            Self::Io(msg) => write!(f, "File error: {}", msg),
            Self::RangeRejected { offset } => {
                write!(f, "Server rejected resume from byte {}", offset)
            }
        }
    }
}

impl std::error::Error for TransferError {}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Bytes written so far against the expected total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
}

impl TransferProgress {
    /// Completed fraction in `[0, 1]`; 0 when the total is unknown.
    pub fn fraction(&self) -> f64 {
        match self.bytes_expected {
            Some(total) if total > 0 => (self.bytes_written as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// Response body handed back by a [`Transport`].
pub struct TransferBody {
    /// True when the body starts at the requested offset.
    pub resumed: bool,
    /// Size of the complete resource, if the server reported it.
    pub total_len: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for TransferBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBody")
            .field("resumed", &self.resumed)
            .field("total_len", &self.total_len)
            .finish_non_exhaustive()
    }
}

/// Source of ranged byte streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open `url` starting at byte `offset`.
    async fn open(&self, url: &str, offset: u64) -> Result<TransferBody, TransferError>;
}
