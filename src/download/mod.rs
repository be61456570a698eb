// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background episode download queue.
//!
//! Provides a persistent queue of episode downloads with:
//! - At most `max_concurrent` transfers running at once
//! - Pause, resume and delete per item
//! - Crash-safe state: interrupted work comes back paused after a restart
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────┐
//! │ TransferQueue   │────▶│ ResumableTransfer    │
//! │ (admission)     │     │ (spawned tokio task) │
//! └────────┬────────┘     └──────────┬───────────┘
//!          │                         │
//!          ▼                         ▼
//! ┌─────────────────┐     ┌──────────────────────┐
//! │ QueueState      │     │ Transport            │
//! │ (BlobStore)     │     │ (HTTP / memory)      │
//! └─────────────────┘     └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tvtrack::config::ClientConfig;
//! use tvtrack::download::{QueueOptions, TransferQueue};
//! use tvtrack::store::FileStore;
//! use tvtrack::transfer::HttpTransport;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ClientConfig::load()?;
//! let queue = TransferQueue::open(
//!     QueueOptions::from_config(&config),
//!     Arc::new(FileStore::new(config.state_dir())),
//!     Arc::new(HttpTransport::new(&config)?),
//! );
//!
//! queue.enqueue("/media/12/3.mp4", "Show - 03.mp4", 12, 3).await;
//! let _subscription = queue.subscribe(|items| println!("{} items", items.len()));
//! queue.wait_idle().await;
//! # Ok(())
//! # }
//! ```

pub mod manager;
pub mod state;
pub mod types;

pub use manager::{EnqueueOutcome, QueueOptions, TransferQueue};
pub use state::{StatusCounts, QUEUE_BLOB};
pub use types::{ItemKey, TransferItem, TransferStatus, TransitionError};
